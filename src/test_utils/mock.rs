// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A host backed by the test process's heap.
//!
//! Frames are 4K-aligned zeroed heap blocks and physical addresses equal
//! virtual ones. Clones share state, so a test can keep a handle on the HAL
//! it gave to an [`Mmu`].

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memory_addr::{PhysAddr, VirtAddr};

use crate::GuestPhysAddr;
use crate::config::MmuConfig;
use crate::fault::{ErrorCode, PageFault, PfOutcome};
use crate::frame::PageCache;
use crate::hal::MmuHal;
use crate::level::{Gfn, PG_LEVEL_2M, gfn_to_gpa};
use crate::mmu::{Mmu, MmuRoot};
use crate::slot::{MemSlotDesc, SlotFlags};

const FRAME_LAYOUT: Layout = match Layout::from_size_align(4096, 4096) {
    Ok(layout) => layout,
    Err(_) => panic!("bad frame layout"),
};

#[derive(Debug, Default)]
struct MockState {
    live: Mutex<BTreeSet<usize>>,
    allocs: AtomicUsize,
    /// Further allocations allowed; `usize::MAX` means unlimited.
    alloc_budget: AtomicUsize,
    flushes: AtomicUsize,
    ranged_flushes: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockHal {
    state: Arc<MockState>,
}

impl MockHal {
    pub fn new() -> Self {
        let state = MockState {
            alloc_budget: AtomicUsize::new(usize::MAX),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Lets only `n` more frames be allocated.
    pub fn set_alloc_limit(&self, n: usize) {
        self.state.alloc_budget.store(n, Ordering::SeqCst);
    }

    pub fn clear_alloc_limit(&self) {
        self.state.alloc_budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Frames allocated and not yet freed.
    pub fn live_frames(&self) -> usize {
        self.state.live.lock().unwrap().len()
    }

    pub fn alloc_count(&self) -> usize {
        self.state.allocs.load(Ordering::SeqCst)
    }

    /// Full and ranged remote TLB flushes.
    pub fn flush_count(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst) + self.state.ranged_flushes.load(Ordering::SeqCst)
    }
}

impl MmuHal for MockHal {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        self.state
            .alloc_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .ok()?;
        let ptr = unsafe { alloc_zeroed(FRAME_LAYOUT) };
        if ptr.is_null() {
            return None;
        }
        self.state.allocs.fetch_add(1, Ordering::SeqCst);
        self.state.live.lock().unwrap().insert(ptr as usize);
        Some(PhysAddr::from(ptr as usize))
    }

    fn dealloc_frame(&self, paddr: PhysAddr) {
        let removed = self.state.live.lock().unwrap().remove(&paddr.as_usize());
        assert!(removed, "freeing unknown frame {:#x}", paddr);
        unsafe { dealloc(paddr.as_usize() as *mut u8, FRAME_LAYOUT) }
    }

    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::from(paddr.as_usize())
    }

    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
        PhysAddr::from(vaddr.as_usize())
    }

    fn flush_remote_tlbs(&self) {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_remote_tlbs_with_address(&self, _start_gfn: Gfn, _pages: u64) {
        self.state.ranged_flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host frame backing gfn 0 of [`slot_desc`].
pub const HOST_PFN_BASE: u64 = 0x100000;

/// A 1GiB slot at gfn 0 whose host memory is mapped with 2M pages.
pub fn slot_desc(id: u16, flags: SlotFlags) -> MemSlotDesc {
    MemSlotDesc {
        id,
        as_id: 0,
        base_gfn: 0,
        npages: 0x40000,
        host_pfn: HOST_PFN_BASE,
        userspace_addr: 0x4000_0000_0000,
        flags,
        host_level: PG_LEVEL_2M,
    }
}

/// An MMU with the default configuration and [`slot_desc`] installed as
/// slot 0.
pub fn mmu_with_slot(flags: SlotFlags) -> (Mmu<MockHal>, MockHal) {
    mmu_with_config(MmuConfig::default(), flags)
}

pub fn mmu_with_config(config: MmuConfig, flags: SlotFlags) -> (Mmu<MockHal>, MockHal) {
    let hal = MockHal::new();
    let mmu = Mmu::new(hal.clone(), config).unwrap();
    mmu.add_memslot(slot_desc(0, flags)).unwrap();
    (mmu, hal)
}

/// Resolves one fault at `gfn` on `root`, refilling `cache` first the way a
/// vCPU does.
pub fn fault_at(
    mmu: &Mmu<MockHal>,
    cache: &mut PageCache,
    root: &MmuRoot,
    gfn: Gfn,
    error_code: ErrorCode,
) -> (PfOutcome, PageFault) {
    resolve_at(mmu, cache, root, gfn, error_code, false)
}

/// Like [`fault_at`], for a speculative fault.
pub fn prefetch_at(
    mmu: &Mmu<MockHal>,
    cache: &mut PageCache,
    root: &MmuRoot,
    gfn: Gfn,
    error_code: ErrorCode,
) -> (PfOutcome, PageFault) {
    resolve_at(mmu, cache, root, gfn, error_code, true)
}

fn resolve_at(
    mmu: &Mmu<MockHal>,
    cache: &mut PageCache,
    root: &MmuRoot,
    gfn: Gfn,
    error_code: ErrorCode,
    prefetch: bool,
) -> (PfOutcome, PageFault) {
    cache
        .topup(mmu.hal(), mmu.config().walk_cache_min())
        .unwrap();
    let mut fault = PageFault::new(
        GuestPhysAddr::from(gfn_to_gpa(gfn)),
        error_code,
        prefetch,
        mmu.nx_huge_pages_enabled(),
    );
    let outcome = mmu.resolve_fault(cache, root, &mut fault);
    (outcome, fault)
}

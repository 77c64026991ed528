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

//! The nested MMU of one VM.
//!
//! [`Mmu`] owns the shadow page arena, the reverse map and the memslot
//! directory. Structural changes are serialized by one table lock; the
//! memslot directory has its own reader-writer lock and is always taken
//! first. Leaf entries may be read, and write-unprotected, without the table
//! lock: frames of zapped pages are only returned to the host once no
//! lockless walker is running.

mod invalidate;
mod resolve;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::PhysAddr;
use page_table_entry::GenericPTE;
use spin::{Mutex, MutexGuard, RwLock};

use crate::GuestPhysAddr;
use crate::config::MmuConfig;
use crate::frame::PhysFrame;
use crate::hal::MmuHal;
use crate::level::{Gfn, gpa_to_gfn, level_index, level_name, level_size};
use crate::rmap::ReverseMapIndex;
use crate::role::PageRole;
use crate::slot::{MemSlot, MemSlotDesc, MemSlots, SlotId};
use crate::spte::{SptPage, Spte};
use crate::store::{PageTableStore, SpHandle};

/// A reference to the root table of one address space, held by a vCPU.
///
/// Obtained from [`Mmu::load_root`] and returned with [`Mmu::put_root`].
#[derive(Debug)]
pub struct MmuRoot {
    sp: SpHandle,
    hpa: PhysAddr,
    as_id: usize,
    level: u8,
}

impl MmuRoot {
    /// Host physical address to load into the nested page table pointer.
    pub fn hpa(&self) -> PhysAddr {
        self.hpa
    }

    pub fn as_id(&self) -> usize {
        self.as_id
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

/// Everything protected by the table lock.
#[derive(Debug, Default)]
pub(crate) struct MmuState {
    pub(crate) store: PageTableStore,
    pub(crate) rmap: ReverseMapIndex,
    /// Pages that exist only because an executable huge page was split,
    /// oldest first.
    pub(crate) nx_lpage_splits: VecDeque<SpHandle>,
}

#[derive(Debug, Default)]
struct Counters {
    pages_zapped: AtomicU64,
    tlb_flushes: AtomicU64,
    mmio_sptes: AtomicU64,
}

/// A snapshot of MMU-wide statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuStats {
    pub shadow_pages: usize,
    pub rmap_entries: usize,
    pub nx_lpage_splits: usize,
    pub pages_zapped: u64,
    pub tlb_flushes: u64,
    pub mmio_sptes: u64,
}

pub struct Mmu<H: MmuHal> {
    hal: H,
    config: MmuConfig,
    nx_huge_pages: AtomicBool,
    state: Mutex<MmuState>,
    slots: RwLock<MemSlots>,
    /// Bumped at the end of every host-side invalidation.
    invalidate_seq: AtomicU64,
    /// Host-side invalidations currently between start and end.
    invalidate_in_progress: AtomicUsize,
    lockless_walkers: AtomicUsize,
    counters: Counters,
}

impl<H: MmuHal> Mmu<H> {
    pub fn new(hal: H, config: MmuConfig) -> AxResult<Self> {
        config.validate()?;
        let nx_huge_pages = config.nx_huge_pages_enabled();
        info!(
            "nested MMU: {}-level tables, huge pages up to {}, NX huge pages {}",
            config.root_level,
            level_name(config.max_huge_level),
            if nx_huge_pages { "on" } else { "off" }
        );
        Ok(Self {
            hal,
            config,
            nx_huge_pages: AtomicBool::new(nx_huge_pages),
            state: Mutex::new(MmuState::default()),
            slots: RwLock::new(MemSlots::new()),
            invalidate_seq: AtomicU64::new(0),
            invalidate_in_progress: AtomicUsize::new(0),
            lockless_walkers: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub fn nx_huge_pages_enabled(&self) -> bool {
        self.nx_huge_pages.load(Ordering::Relaxed)
    }

    /// Takes the table lock, giving up after a bounded number of attempts.
    fn lock_state(&self) -> Option<MutexGuard<'_, MmuState>> {
        for _ in 0..self.config.max_lock_retries {
            if let Some(guard) = self.state.try_lock() {
                return Some(guard);
            }
            core::hint::spin_loop();
        }
        None
    }

    /// Gets a reference to the root of address space `as_id`, creating the
    /// root if there is no valid one.
    pub fn load_root(&self, as_id: usize) -> AxResult<MmuRoot> {
        if as_id > 1 {
            return ax_err!(InvalidInput, "address space id out of range");
        }
        let frame = PhysFrame::alloc(&self.hal)?;
        let role = PageRole::direct_root(self.config.root_level, as_id);

        let mut st = self.state.lock();
        let sp = match st.store.lookup_root(role) {
            Some(sp) => {
                frame.dealloc(&self.hal);
                sp
            }
            None => st.store.create(&self.hal, role, 0, frame),
        };
        let page = st.store.page_mut(sp);
        page.root_count += 1;
        debug!(
            "loaded root {:?} of as {} at {:#x}, {} users",
            sp,
            as_id,
            page.hpa(),
            page.root_count
        );
        Ok(MmuRoot {
            sp,
            hpa: page.hpa(),
            as_id,
            level: self.config.root_level,
        })
    }

    /// Drops a reference obtained from [`Mmu::load_root`]. An obsolete root
    /// is freed with its last reference.
    pub fn put_root(&self, root: MmuRoot) {
        let slots = self.slots.read();
        let mut st = self.state.lock();
        if !st.store.contains(root.sp) || st.store.page(root.sp).hpa() != root.hpa {
            error!("putting unknown root {:?}", root);
            return;
        }

        let page = st.store.page_mut(root.sp);
        if page.root_count == 0 {
            error!("root {:?} has no users", root.sp);
            return;
        }
        page.root_count -= 1;

        let valid_gen = st.store.valid_gen();
        let page = st.store.page(root.sp);
        if page.root_count == 0 && page.is_obsolete(valid_gen) {
            let mut invalid_list = Vec::new();
            self.zap_page(&mut st, &slots, root.sp, &mut invalid_list);
            self.commit_zap(&mut st, invalid_list);
        }
    }

    /// Whether `root` has been zapped and must be reloaded.
    pub fn is_root_obsolete(&self, root: &MmuRoot) -> bool {
        let st = self.state.lock();
        !st.store.contains(root.sp) || st.store.page(root.sp).is_obsolete(st.store.valid_gen())
    }

    pub fn add_memslot(&self, desc: MemSlotDesc) -> AxResult {
        let slot = MemSlot::new(desc)?;
        let mut slots = self.slots.write();
        slots.insert(slot)?;
        self.memslots_changed(&slots);
        Ok(())
    }

    /// Removes a memslot after zapping every mapping of it.
    pub fn remove_memslot(&self, id: SlotId) -> AxResult {
        let mut slots = self.slots.write();
        if slots.get(id).is_none() {
            return ax_err!(NotFound, "no such memory slot");
        }
        {
            let mut st = self.state.lock();
            let mut flush = false;
            for key in st.rmap.slot_keys(id) {
                flush |= self.zap_rmap(&mut st, key);
            }
            if flush {
                self.flush_remote_tlbs();
            }
        }
        slots.remove(id)?;
        self.memslots_changed(&slots);
        Ok(())
    }

    /// Runs `f` on memslot `id`.
    pub fn with_memslot<R>(&self, id: SlotId, f: impl FnOnce(&MemSlot) -> R) -> AxResult<R> {
        let slots = self.slots.read();
        let slot = slots
            .get(id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        Ok(f(slot))
    }

    pub fn memslot_generation(&self) -> u64 {
        self.slots.read().generation()
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn stats(&self) -> MmuStats {
        let st = self.state.lock();
        MmuStats {
            shadow_pages: st.store.len(),
            rmap_entries: st.rmap.len(),
            nx_lpage_splits: st.nx_lpage_splits.len(),
            pages_zapped: self.counters.pages_zapped.load(Ordering::Relaxed),
            tlb_flushes: self.counters.tlb_flushes.load(Ordering::Relaxed),
            mmio_sptes: self.counters.mmio_sptes.load(Ordering::Relaxed),
        }
    }

    /// The leaf entry mapping `gfn` under `root` and its level.
    pub fn lookup_spte(&self, root: &MmuRoot, gfn: Gfn) -> Option<(Spte, u8)> {
        self.walk_lockless_begin();
        let (_, _, level, spte) = self.lockless_leaf(root, gfn);
        self.walk_lockless_end();
        (spte.is_shadow_present() && spte.is_last(level)).then_some((spte, level))
    }

    /// Host physical address `gpa` is mapped to under `root`.
    pub fn translate(&self, root: &MmuRoot, gpa: GuestPhysAddr) -> Option<PhysAddr> {
        let (spte, level) = self.lookup_spte(root, gpa_to_gfn(gpa.as_usize()))?;
        Some(spte.paddr() + (gpa.as_usize() & (level_size(level) - 1)))
    }

    /// Table at host physical address `hpa`.
    fn table(&self, hpa: PhysAddr) -> &SptPage {
        // Tables stay mapped until they are freed, which waits for lockless
        // walkers and for the table lock.
        unsafe { &*(self.hal.phys_to_virt(hpa).as_ptr() as *const SptPage) }
    }

    fn walk_lockless_begin(&self) {
        self.lockless_walkers.fetch_add(1, Ordering::SeqCst);
    }

    fn walk_lockless_end(&self) {
        self.lockless_walkers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Walks towards `gfn` without the table lock. Returns the table, index,
    /// level and value of the last entry reached.
    fn lockless_leaf(&self, root: &MmuRoot, gfn: Gfn) -> (&SptPage, usize, u8, Spte) {
        let mut table = self.table(root.hpa);
        let mut level = root.level;
        loop {
            let index = level_index(gfn, level);
            let spte = table.load(index);
            if !spte.is_shadow_present() || spte.is_last(level) {
                return (table, index, level, spte);
            }
            table = self.table(spte.paddr());
            level -= 1;
        }
    }

    fn flush_remote_tlbs(&self) {
        self.counters.tlb_flushes.fetch_add(1, Ordering::Relaxed);
        self.hal.flush_remote_tlbs();
    }

    fn flush_remote_tlbs_with_address(&self, start_gfn: Gfn, pages: u64) {
        self.counters.tlb_flushes.fetch_add(1, Ordering::Relaxed);
        self.hal.flush_remote_tlbs_with_address(start_gfn, pages);
    }

    /// Returns frames of evicted pages to the host once no lockless walker
    /// can still be looking at them.
    fn free_pending(&self, st: &mut MmuState) {
        fence(Ordering::SeqCst);
        if st.store.has_pending_free() && self.lockless_walkers.load(Ordering::SeqCst) == 0 {
            for frame in st.store.take_pending_free() {
                frame.dealloc(&self.hal);
            }
        }
    }
}

impl<H: MmuHal> Drop for Mmu<H> {
    fn drop(&mut self) {
        let frames = self.state.get_mut().store.drain_frames();
        debug!("tearing down nested MMU, {} frames", frames.len());
        for frame in frames {
            frame.dealloc(&self.hal);
        }
    }
}

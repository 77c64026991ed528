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

//! Tests for nested page fault resolution.

use memory_addr::PhysAddr;

use crate::GuestPhysAddr;
use crate::config::MmuConfig;
use crate::fault::{ErrorCode, FaultState, PageFault, PfOutcome};
use crate::frame::PageCache;
use crate::hugepage::NxHugePages;
use crate::level::{PG_LEVEL_2M, PG_LEVEL_4K};
use crate::slot::{MemSlotDesc, SlotFlags};
use crate::spte::MMIO_GEN_MASK;
use crate::test_utils::mock::{
    HOST_PFN_BASE, fault_at, mmu_with_config, mmu_with_slot, prefetch_at, slot_desc,
};
use crate::vcpu::VcpuMmu;

fn nx_config() -> MmuConfig {
    MmuConfig {
        nx_huge_pages: NxHugePages::Force,
        ..Default::default()
    }
}

#[test]
fn test_write_fault_maps_2m() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_2M);
    assert_eq!(fault.state(), FaultState::Done(PfOutcome::Fixed));
    // Root, 1G table and 2M table.
    assert_eq!(mmu.page_count(), 3);

    let (spte, level) = mmu.lookup_spte(&root, 0x1000).unwrap();
    assert_eq!(level, PG_LEVEL_2M);
    assert_eq!(spte.pfn(), HOST_PFN_BASE + 0x1000);
    assert!(spte.is_writable());
    assert!(spte.is_dirty());
    assert_eq!(
        mmu.translate(&root, GuestPhysAddr::from(0x100_0123)),
        Some(PhysAddr::from(((HOST_PFN_BASE as usize) << 12) + 0x100_0123))
    );
    assert_eq!(mmu.stats().rmap_entries, 1);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_read_after_write_is_spurious() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    let pages = mmu.page_count();

    // Another gfn of the same 2M page, through the slow path.
    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1001, ErrorCode::empty());
    assert_eq!(outcome, PfOutcome::Spurious);
    // And through the lockless path.
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1001, ErrorCode::PRESENT);
    assert_eq!(outcome, PfOutcome::Spurious);
    assert!(!fault.fast_fixed);

    assert_eq!(mmu.page_count(), pages);
    assert_eq!(mmu.stats().rmap_entries, 1);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_out_of_memory_mid_walk_rolls_back() {
    let (mmu, hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    assert_eq!(mmu.page_count(), 1);

    // Enough for the 1G table, not for the 2M one.
    let mut cache = PageCache::new();
    cache.topup(&hal, 1).unwrap();
    let mut fault = PageFault::new(
        GuestPhysAddr::from(0x100_0000),
        ErrorCode::WRITE,
        false,
        false,
    );
    let outcome = mmu.resolve_fault(&mut cache, &root, &mut fault);
    assert_eq!(outcome, PfOutcome::Retry);
    assert_eq!(fault.state(), FaultState::Done(PfOutcome::Retry));
    assert_eq!(mmu.page_count(), 1);
    assert!(mmu.lookup_spte(&root, 0x1000).is_none());
    assert_eq!(mmu.stats().rmap_entries, 0);

    // A retry with a full cache succeeds.
    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_goal_level_respects_config() {
    let config = MmuConfig {
        max_huge_level: PG_LEVEL_4K,
        ..Default::default()
    };
    let (mmu, _hal) = mmu_with_config(config, SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    assert!(fault.goal_level <= fault.max_level);
    assert_eq!(mmu.page_count(), 4);
    assert_eq!(mmu.lookup_spte(&root, 0x1000).unwrap().1, PG_LEVEL_4K);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_goal_level_respects_host_mapping() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let mut desc = slot_desc(1, SlotFlags::empty());
    desc.base_gfn = 0x40000;
    desc.host_pfn = 0x200000;
    desc.host_level = PG_LEVEL_4K;
    mmu.add_memslot(desc).unwrap();
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x40000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    assert_eq!(fault.pfn, 0x200000);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_disallow_and_allow_lpage() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    mmu.disallow_lpage(0, 0x1000).unwrap();
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    assert_eq!(mmu.page_count(), 4);

    // Once allowed again, the next fault collapses the 4K table.
    mmu.allow_lpage(0, 0x1000).unwrap();
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_2M);
    assert_eq!(mmu.page_count(), 3);
    assert_eq!(mmu.lookup_spte(&root, 0x1000).unwrap().1, PG_LEVEL_2M);
    assert_eq!(mmu.stats().rmap_entries, 1);

    assert!(mmu.disallow_lpage(0, 0x40000).is_err());
    assert!(mmu.disallow_lpage(7, 0x1000).is_err());

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_nx_exec_fault_maps_4k() {
    let (mmu, _hal) = mmu_with_config(nx_config(), SlotFlags::empty());
    assert!(mmu.nx_huge_pages_enabled());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::FETCH);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert!(fault.huge_page_disallowed);
    assert_eq!(fault.req_level, PG_LEVEL_2M);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);

    let (spte, level) = mmu.lookup_spte(&root, 0x1000).unwrap();
    assert_eq!(level, PG_LEVEL_4K);
    assert!(spte.is_executable());
    // Only the 4K table stands in for a possible huge page.
    assert_eq!(mmu.stats().nx_lpage_splits, 1);

    // Its neighbours keep using the split table.
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1001, ErrorCode::empty());
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    assert_eq!(fault.pfn, HOST_PFN_BASE + 0x1001);
    assert_eq!(mmu.page_count(), 4);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_huge_leaf_not_executable_with_nx() {
    let (mmu, _hal) = mmu_with_config(nx_config(), SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x2000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    let (spte, level) = mmu.lookup_spte(&root, 0x2000).unwrap();
    assert_eq!(level, PG_LEVEL_2M);
    assert!(!spte.is_executable());

    // Executing from it splits the huge page.
    let (outcome, fault) = fault_at(
        &mmu,
        &mut cache,
        &root,
        0x2000,
        ErrorCode::PRESENT | ErrorCode::FETCH,
    );
    assert_eq!(outcome, PfOutcome::Fixed);
    assert!(!fault.fast_fixed);
    let (spte, level) = mmu.lookup_spte(&root, 0x2000).unwrap();
    assert_eq!(level, PG_LEVEL_4K);
    assert!(spte.is_executable());

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_write_protect_then_write() {
    let (mmu, hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);

    let flushes = hal.flush_count();
    assert!(mmu.write_protect(0, 0x1000, PG_LEVEL_4K));
    assert!(hal.flush_count() > flushes);
    assert!(!mmu.write_protect(0, 0x1000, PG_LEVEL_4K));
    let (spte, _) = mmu.lookup_spte(&root, 0x1000).unwrap();
    assert!(!spte.is_writable());
    assert!(!spte.can_be_made_writable());

    // Fully protected entries are restored by the slow path.
    let (outcome, fault) = fault_at(
        &mmu,
        &mut cache,
        &root,
        0x1000,
        ErrorCode::PRESENT | ErrorCode::WRITE,
    );
    assert_eq!(outcome, PfOutcome::Fixed);
    assert!(!fault.fast_fixed);
    assert!(mmu.lookup_spte(&root, 0x1000).unwrap().0.is_writable());
    assert_eq!(mmu.stats().rmap_entries, 1);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_prefetch_fills_only_empty_entries() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert!(mmu.write_protect(0, 0x1000, PG_LEVEL_4K));

    // A speculative write does not undo the protection.
    let (outcome, _) = prefetch_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Spurious);
    assert!(!mmu.lookup_spte(&root, 0x1000).unwrap().0.is_writable());

    let (outcome, _) = prefetch_at(&mmu, &mut cache, &root, 0x3000, ErrorCode::empty());
    assert_eq!(outcome, PfOutcome::Fixed);
    let (spte, level) = mmu.lookup_spte(&root, 0x3000).unwrap();
    assert_eq!(level, PG_LEVEL_2M);
    assert!(!spte.is_accessed());
    assert_eq!(mmu.stats().rmap_entries, 2);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_readonly_slot_write_emulates() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::READONLY);
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Emulate);
    assert!(mmu.lookup_spte(&root, 0x1000).is_none());

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::empty());
    assert_eq!(outcome, PfOutcome::Fixed);
    let (spte, _) = mmu.lookup_spte(&root, 0x1000).unwrap();
    assert!(!spte.is_writable());
    assert!(!spte.is_host_writable());

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_write_tracked_gfn_emulates() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    mmu.track_write(0, 0x1000).unwrap();
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Emulate);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    // The read-only leaf is still installed.
    let (spte, level) = mmu.lookup_spte(&root, 0x1000).unwrap();
    assert_eq!(level, PG_LEVEL_4K);
    assert!(!spte.is_writable());

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1001, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);

    mmu.untrack_write(0, 0x1000).unwrap();
    assert!(mmu.untrack_write(0, 0x1000).is_err());
    let (outcome, _) = fault_at(
        &mmu,
        &mut cache,
        &root,
        0x1000,
        ErrorCode::PRESENT | ErrorCode::WRITE,
    );
    assert_eq!(outcome, PfOutcome::Fixed);
    assert!(mmu.lookup_spte(&root, 0x1000).unwrap().0.is_writable());

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_mmio_caching() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    // No memslot covers gfn 0x50000.
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x50000, ErrorCode::empty());
    assert_eq!(outcome, PfOutcome::Emulate);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    assert!(fault.slot.is_none());
    assert_eq!(mmu.stats().mmio_sptes, 1);
    assert!(mmu.lookup_spte(&root, 0x50000).is_none());

    // The hardware now reports the cached entry.
    let mmio = ErrorCode::RSVD | ErrorCode::PRESENT;
    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x50000, mmio);
    assert_eq!(outcome, PfOutcome::Emulate);
    assert_eq!(mmu.stats().mmio_sptes, 1);

    // Memory appears; the stale entry goes through the slow path.
    let mut desc = slot_desc(1, SlotFlags::empty());
    desc.base_gfn = 0x40000;
    desc.host_pfn = 0x200000;
    desc.userspace_addr = 0x5000_0000_0000;
    mmu.add_memslot(desc).unwrap();
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x50000, mmio);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.slot, Some(1));
    let (spte, level) = mmu.lookup_spte(&root, 0x50000).unwrap();
    assert_eq!(level, PG_LEVEL_2M);
    assert_eq!(spte.pfn(), 0x210000);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_mmio_entries_dropped_on_generation_wrap() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let mut vcpu = VcpuMmu::new(0);
    let gpa = GuestPhysAddr::from(0x5000_0000);
    let mmio = ErrorCode::RSVD | ErrorCode::PRESENT;

    let outcome = vcpu.do_page_fault(&mmu, gpa, ErrorCode::empty(), false);
    assert_eq!(outcome, PfOutcome::Emulate);
    assert_eq!(mmu.memslot_generation(), 1);

    // Walk the generation once around the bits an MMIO entry keeps.
    for i in 0..MMIO_GEN_MASK {
        mmu.set_dirty_logging(0, i % 2 == 0).unwrap();
    }
    assert_eq!(mmu.memslot_generation(), MMIO_GEN_MASK + 1);

    let mut desc = slot_desc(1, SlotFlags::empty());
    desc.base_gfn = 0x40000;
    desc.host_pfn = 0x200000;
    desc.userspace_addr = 0x5000_0000_0000;
    mmu.add_memslot(desc).unwrap();
    assert_eq!(mmu.memslot_generation() & MMIO_GEN_MASK, 1);

    // The entry went away with the wrap, so it cannot match again.
    let outcome = vcpu.do_page_fault(&mmu, gpa, mmio, false);
    assert_eq!(outcome, PfOutcome::Retry);
    let outcome = vcpu.do_page_fault(&mmu, gpa, ErrorCode::WRITE, false);
    assert_eq!(outcome, PfOutcome::Fixed);
    let (spte, _) = mmu.lookup_spte(vcpu.root().unwrap(), 0x50000).unwrap();
    assert_eq!(spte.pfn(), 0x210000);

    vcpu.destroy(&mmu);
}

#[test]
fn test_reserved_bit_fault_on_zapped_mmio_entry_retries() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let mut vcpu = VcpuMmu::new(0);
    let gpa = GuestPhysAddr::from(0x5000_0000);
    let mmio = ErrorCode::RSVD | ErrorCode::PRESENT;

    let outcome = vcpu.do_page_fault(&mmu, gpa, ErrorCode::empty(), false);
    assert_eq!(outcome, PfOutcome::Emulate);

    // Emulated writes to the 4K table holding the entry zap it.
    let zapped: usize = (0..3).map(|_| mmu.note_emulated_write(0, 0x50000)).sum();
    assert_eq!(zapped, 1);

    let outcome = vcpu.do_page_fault(&mmu, gpa, mmio, false);
    assert_eq!(outcome, PfOutcome::Retry);
    let outcome = vcpu.do_page_fault(&mmu, gpa, ErrorCode::empty(), false);
    assert_eq!(outcome, PfOutcome::Emulate);

    vcpu.destroy(&mmu);
}

#[test]
fn test_reserved_bit_fault_on_memory_retries() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let mmio = ErrorCode::RSVD | ErrorCode::PRESENT;
    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, mmio);
    assert_eq!(outcome, PfOutcome::Retry);

    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    let (outcome, _) = fault_at(&mmu, &mut cache, &root, 0x1000, mmio);
    assert_eq!(outcome, PfOutcome::Retry);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_malformed_fault_is_invalid() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x1000, ErrorCode::RSVD);
    assert_eq!(outcome, PfOutcome::Invalid);
    assert_eq!(fault.state(), FaultState::Done(PfOutcome::Invalid));

    let (outcome, _) = fault_at(
        &mmu,
        &mut cache,
        &root,
        0x1000,
        ErrorCode::FETCH | ErrorCode::WRITE,
    );
    assert_eq!(outcome, PfOutcome::Invalid);
    assert_eq!(mmu.page_count(), 1);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

#[test]
fn test_unaligned_slot_maps_4k() {
    let (mmu, _hal) = mmu_with_slot(SlotFlags::empty());
    mmu.add_memslot(MemSlotDesc {
        id: 1,
        as_id: 0,
        base_gfn: 0x40001,
        npages: 0x1000,
        host_pfn: 0x300001,
        userspace_addr: 0x6000_0000_1000,
        flags: SlotFlags::empty(),
        host_level: PG_LEVEL_2M,
    })
    .unwrap();
    let root = mmu.load_root(0).unwrap();
    let mut cache = PageCache::new();

    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x40001, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_4K);
    // Whole 2M regions in the middle of the slot still map huge.
    let (outcome, fault) = fault_at(&mmu, &mut cache, &root, 0x40400, ErrorCode::WRITE);
    assert_eq!(outcome, PfOutcome::Fixed);
    assert_eq!(fault.goal_level, PG_LEVEL_2M);

    cache.free_all(mmu.hal());
    mmu.put_root(root);
}

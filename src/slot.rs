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

//! Guest memory slots: which host frames back which guest frames, and the
//! per-gfn metadata the MMU keeps next to them.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};
use bitflags::bitflags;
use memory_addr::{VirtAddr, is_aligned_4k};

use crate::level::{
    GFN_LIMIT, Gfn, MAX_HUGEPAGE_LEVEL, NR_LPAGE_LEVELS, PAGE_SHIFT, PG_LEVEL_2M, PG_LEVEL_4K,
    Pfn, gfn_to_index, pages_per_hpage,
};

pub type SlotId = u16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Guest writes must be emulated.
        const READONLY = 1 << 0;
        /// Guest writes are recorded in a dirty bitmap.
        const LOG_DIRTY_PAGES = 1 << 1;
    }
}

/// Parameters of a new memory slot.
#[derive(Debug, Clone, Copy)]
pub struct MemSlotDesc {
    pub id: SlotId,
    pub as_id: usize,
    pub base_gfn: Gfn,
    pub npages: u64,
    /// Host frame backing `base_gfn`.
    pub host_pfn: Pfn,
    /// Host virtual address of `base_gfn`.
    pub userspace_addr: usize,
    pub flags: SlotFlags,
    /// Largest granularity the host maps the backing memory with.
    pub host_level: u8,
}

#[derive(Debug)]
pub struct MemSlot {
    id: SlotId,
    as_id: usize,
    base_gfn: Gfn,
    npages: u64,
    host_pfn: Pfn,
    userspace_addr: usize,
    flags: SlotFlags,
    host_level: u8,
    /// Per huge level, how many reasons forbid a huge mapping of each region.
    lpage_info: [Vec<i32>; NR_LPAGE_LEVELS],
    /// Per-gfn write tracking counts, allocated on first use.
    write_track: Vec<u16>,
    dirty_bitmap: Option<Vec<AtomicU64>>,
}

impl MemSlot {
    pub fn new(desc: MemSlotDesc) -> AxResult<Self> {
        if desc.npages == 0 {
            return ax_err!(InvalidInput, "empty memory slot");
        }
        if !(PG_LEVEL_4K..=MAX_HUGEPAGE_LEVEL).contains(&desc.host_level) {
            return ax_err!(InvalidInput, "host mapping level out of range");
        }
        if !is_aligned_4k(desc.userspace_addr) {
            return ax_err!(InvalidInput, "host address of a slot must be page aligned");
        }
        let fits = |start: u64| {
            start
                .checked_add(desc.npages)
                .is_some_and(|end| end <= GFN_LIMIT)
        };
        if !fits(desc.base_gfn) || !fits(desc.host_pfn) {
            return ax_err!(InvalidInput, "memory slot frame range out of bounds");
        }
        if desc
            .userspace_addr
            .checked_add((desc.npages as usize) << PAGE_SHIFT)
            .is_none()
        {
            return ax_err!(InvalidInput, "memory slot host range out of bounds");
        }

        let lpage_info = core::array::from_fn(|i| {
            Self::init_lpage_info(&desc, PG_LEVEL_2M + i as u8)
        });
        let dirty_bitmap = desc
            .flags
            .contains(SlotFlags::LOG_DIRTY_PAGES)
            .then(|| Self::new_dirty_bitmap(desc.npages));

        Ok(Self {
            id: desc.id,
            as_id: desc.as_id,
            base_gfn: desc.base_gfn,
            npages: desc.npages,
            host_pfn: desc.host_pfn,
            userspace_addr: desc.userspace_addr,
            flags: desc.flags,
            host_level: desc.host_level,
            lpage_info,
            write_track: Vec::new(),
            dirty_bitmap,
        })
    }

    fn init_lpage_info(desc: &MemSlotDesc, level: u8) -> Vec<i32> {
        let last = desc.base_gfn + desc.npages - 1;
        let lpages = gfn_to_index(last, desc.base_gfn, level) + 1;
        let mask = pages_per_hpage(level) - 1;
        let mut info = vec![0; lpages];

        // Regions sticking out of the slot can never be mapped huge.
        if desc.base_gfn & mask != 0 {
            info[0] = 1;
        }
        if (desc.base_gfn + desc.npages) & mask != 0 {
            info[lpages - 1] = 1;
        }
        // Neither can anything if guest and host disagree on the alignment.
        let ugfn = (desc.userspace_addr >> PAGE_SHIFT) as u64;
        if (desc.base_gfn ^ ugfn) & mask != 0 || (desc.base_gfn ^ desc.host_pfn) & mask != 0 {
            info.iter_mut().for_each(|count| *count = 1);
        }
        info
    }

    fn new_dirty_bitmap(npages: u64) -> Vec<AtomicU64> {
        (0..npages.div_ceil(64)).map(|_| AtomicU64::new(0)).collect()
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn as_id(&self) -> usize {
        self.as_id
    }

    pub fn base_gfn(&self) -> Gfn {
        self.base_gfn
    }

    pub fn npages(&self) -> u64 {
        self.npages
    }

    pub fn end_gfn(&self) -> Gfn {
        self.base_gfn + self.npages
    }

    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    pub fn host_level(&self) -> u8 {
        self.host_level
    }

    pub fn contains(&self, gfn: Gfn) -> bool {
        (self.base_gfn..self.end_gfn()).contains(&gfn)
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(SlotFlags::READONLY)
    }

    pub fn is_dirty_logging(&self) -> bool {
        self.flags.contains(SlotFlags::LOG_DIRTY_PAGES)
    }

    pub fn gfn_to_pfn(&self, gfn: Gfn) -> Pfn {
        self.host_pfn + (gfn - self.base_gfn)
    }

    pub fn gfn_to_hva(&self, gfn: Gfn) -> VirtAddr {
        VirtAddr::from(self.userspace_addr + (((gfn - self.base_gfn) as usize) << PAGE_SHIFT))
    }

    fn lpage_count(&self, gfn: Gfn, level: u8) -> i32 {
        self.lpage_info[(level - PG_LEVEL_2M) as usize][gfn_to_index(gfn, self.base_gfn, level)]
    }

    /// Whether the `level`-sized region containing `gfn` may be mapped by a
    /// single entry.
    pub fn lpage_allowed(&self, gfn: Gfn, level: u8) -> bool {
        level == PG_LEVEL_4K || self.lpage_count(gfn, level) == 0
    }

    fn update_disallow_lpage_count(&mut self, gfn: Gfn, count: i32) {
        for level in PG_LEVEL_2M..=MAX_HUGEPAGE_LEVEL {
            let index = gfn_to_index(gfn, self.base_gfn, level);
            let slot = &mut self.lpage_info[(level - PG_LEVEL_2M) as usize][index];
            *slot += count;
            if *slot < 0 {
                error!(
                    "slot {}: disallow_lpage underflow at gfn {:#x} level {}",
                    self.id, gfn, level
                );
            }
        }
    }

    /// Forbids huge mappings of every region containing `gfn`.
    pub fn disallow_lpage(&mut self, gfn: Gfn) {
        self.update_disallow_lpage_count(gfn, 1);
    }

    /// Drops one reason for forbidding huge mappings around `gfn`.
    pub fn allow_lpage(&mut self, gfn: Gfn) {
        self.update_disallow_lpage_count(gfn, -1);
    }

    pub fn is_write_tracked(&self, gfn: Gfn) -> bool {
        self.write_track
            .get((gfn - self.base_gfn) as usize)
            .is_some_and(|&count| count != 0)
    }

    pub(crate) fn add_write_track(&mut self, gfn: Gfn) -> AxResult {
        if self.write_track.is_empty() {
            self.write_track = vec![0; self.npages as usize];
        }
        let count = &mut self.write_track[(gfn - self.base_gfn) as usize];
        *count = count
            .checked_add(1)
            .ok_or_else(|| ax_err_type!(BadState, "write track count overflow"))?;
        Ok(())
    }

    pub(crate) fn remove_write_track(&mut self, gfn: Gfn) -> AxResult {
        let Some(count) = self
            .write_track
            .get_mut((gfn - self.base_gfn) as usize)
            .filter(|count| **count != 0)
        else {
            return ax_err!(BadState, "gfn is not write tracked");
        };
        *count -= 1;
        Ok(())
    }

    pub(crate) fn set_dirty_logging(&mut self, enable: bool) {
        self.flags.set(SlotFlags::LOG_DIRTY_PAGES, enable);
        self.dirty_bitmap = enable.then(|| Self::new_dirty_bitmap(self.npages));
    }

    /// Records a guest write to `gfn`. No-op unless dirty logging is enabled.
    pub fn mark_dirty(&self, gfn: Gfn) {
        if let Some(bitmap) = &self.dirty_bitmap {
            let rel = gfn - self.base_gfn;
            bitmap[(rel / 64) as usize].fetch_or(1 << (rel % 64), Ordering::Relaxed);
        }
    }

    pub fn is_dirty(&self, gfn: Gfn) -> bool {
        self.dirty_bitmap.as_ref().is_some_and(|bitmap| {
            let rel = gfn - self.base_gfn;
            bitmap[(rel / 64) as usize].load(Ordering::Relaxed) & (1 << (rel % 64)) != 0
        })
    }

    /// Returns the dirty bitmap and resets it.
    pub fn take_dirty_log(&self) -> Vec<u64> {
        match &self.dirty_bitmap {
            Some(bitmap) => bitmap.iter().map(|w| w.swap(0, Ordering::Relaxed)).collect(),
            None => Vec::new(),
        }
    }
}

/// All memory slots of a VM.
#[derive(Debug, Default)]
pub struct MemSlots {
    slots: BTreeMap<SlotId, MemSlot>,
    generation: u64,
}

impl MemSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every change to the slot layout or flags.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn insert(&mut self, slot: MemSlot) -> AxResult {
        if self.slots.contains_key(&slot.id) {
            return ax_err!(AlreadyExists, "memory slot id in use");
        }
        let overlaps = self.slots.values().any(|s| {
            s.as_id == slot.as_id && s.base_gfn < slot.end_gfn() && slot.base_gfn < s.end_gfn()
        });
        if overlaps {
            return ax_err!(AlreadyExists, "memory slot overlaps an existing one");
        }
        debug!(
            "memslot {}: as {} gfn [{:#x}, {:#x}) flags {:?}",
            slot.id,
            slot.as_id,
            slot.base_gfn,
            slot.end_gfn(),
            slot.flags
        );
        self.slots.insert(slot.id, slot);
        self.generation += 1;
        Ok(())
    }

    pub fn remove(&mut self, id: SlotId) -> AxResult<MemSlot> {
        let slot = self
            .slots
            .remove(&id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        self.generation += 1;
        Ok(slot)
    }

    pub fn get(&self, id: SlotId) -> Option<&MemSlot> {
        self.slots.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut MemSlot> {
        self.slots.get_mut(&id)
    }

    pub(crate) fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Slot of address space `as_id` containing `gfn`.
    pub fn lookup(&self, as_id: usize, gfn: Gfn) -> Option<&MemSlot> {
        self.slots
            .values()
            .find(|s| s.as_id == as_id && s.contains(gfn))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemSlot> {
        self.slots.values()
    }
}

#[cfg(test)]
mod tests {
    use axerrno::AxError;

    use super::*;
    use crate::level::PG_LEVEL_1G;

    fn desc(base_gfn: Gfn, npages: u64) -> MemSlotDesc {
        MemSlotDesc {
            id: 0,
            as_id: 0,
            base_gfn,
            npages,
            host_pfn: 0x80000 + base_gfn,
            userspace_addr: 0x7f00_0000_0000 + ((base_gfn as usize) << PAGE_SHIFT),
            flags: SlotFlags::empty(),
            host_level: PG_LEVEL_1G,
        }
    }

    #[test]
    fn test_aligned_slot_allows_huge_pages() {
        let slot = MemSlot::new(desc(0, 0x80000)).unwrap();
        assert!(slot.lpage_allowed(0x1000, PG_LEVEL_2M));
        assert!(slot.lpage_allowed(0x1000, PG_LEVEL_1G));
        assert!(slot.lpage_allowed(0x7ffff, PG_LEVEL_2M));
    }

    #[test]
    fn test_misaligned_head_and_tail() {
        // Starts 1 page into a 2M region and ends 1 page short of one.
        let slot = MemSlot::new(desc(0x201, 0x3fe)).unwrap();
        assert!(!slot.lpage_allowed(0x201, PG_LEVEL_2M));
        assert!(!slot.lpage_allowed(0x400, PG_LEVEL_2M));
        assert!(!slot.lpage_allowed(0x201, PG_LEVEL_1G));
        assert!(!slot.lpage_allowed(0x5fe, PG_LEVEL_2M));
        assert!(slot.lpage_allowed(0x201, PG_LEVEL_4K));
    }

    #[test]
    fn test_host_misalignment_disallows_everything() {
        let mut d = desc(0, 0x1000);
        d.userspace_addr += 0x1000;
        let slot = MemSlot::new(d).unwrap();
        assert!(!slot.lpage_allowed(0x200, PG_LEVEL_2M));
        assert!(!slot.lpage_allowed(0x0, PG_LEVEL_2M));
    }

    #[test]
    fn test_disallow_allow_round_trip() {
        let mut slot = MemSlot::new(desc(0, 0x80000)).unwrap();
        let before_2m = slot.lpage_allowed(0x1234, PG_LEVEL_2M);
        let before_1g = slot.lpage_allowed(0x1234, PG_LEVEL_1G);

        slot.disallow_lpage(0x1234);
        slot.disallow_lpage(0x1234);
        assert!(!slot.lpage_allowed(0x1200, PG_LEVEL_2M));
        assert!(!slot.lpage_allowed(0x0, PG_LEVEL_1G));
        // Neighbouring 2M regions are unaffected.
        assert!(slot.lpage_allowed(0x1400, PG_LEVEL_2M));

        slot.allow_lpage(0x1234);
        assert!(!slot.lpage_allowed(0x1200, PG_LEVEL_2M));
        slot.allow_lpage(0x1234);
        assert_eq!(slot.lpage_allowed(0x1234, PG_LEVEL_2M), before_2m);
        assert_eq!(slot.lpage_allowed(0x1234, PG_LEVEL_1G), before_1g);
    }

    #[test]
    fn test_translation() {
        let slot = MemSlot::new(desc(0x100, 0x100)).unwrap();
        assert_eq!(slot.gfn_to_pfn(0x180), 0x80180);
        assert_eq!(
            slot.gfn_to_hva(0x101),
            VirtAddr::from(0x7f00_0000_0000 + 0x101000)
        );
        assert!(slot.contains(0x1ff));
        assert!(!slot.contains(0x200));
    }

    #[test]
    fn test_dirty_bitmap() {
        let mut slot = MemSlot::new(desc(0, 0x100)).unwrap();
        slot.mark_dirty(3);
        assert!(!slot.is_dirty(3));

        slot.set_dirty_logging(true);
        slot.mark_dirty(3);
        slot.mark_dirty(65);
        assert!(slot.is_dirty(3));
        let log = slot.take_dirty_log();
        assert_eq!(log[0], 1 << 3);
        assert_eq!(log[1], 1 << 1);
        assert!(!slot.is_dirty(3));
    }

    #[test]
    fn test_slot_range_bounds() {
        let mut d = desc(0, 100);
        d.base_gfn = u64::MAX - 10;
        assert_eq!(MemSlot::new(d).unwrap_err(), AxError::InvalidInput);

        let mut d = desc(0, 0x100);
        d.host_pfn = GFN_LIMIT - 0x80;
        assert_eq!(MemSlot::new(d).unwrap_err(), AxError::InvalidInput);

        let mut d = desc(0, 0x100);
        d.userspace_addr = usize::MAX & !0xfff;
        assert_eq!(MemSlot::new(d).unwrap_err(), AxError::InvalidInput);

        let mut d = desc(0, 0x200);
        d.base_gfn = GFN_LIMIT - 0x200;
        let slot = MemSlot::new(d).unwrap();
        assert_eq!(slot.end_gfn(), GFN_LIMIT);
    }

    #[test]
    fn test_write_track_counts() {
        let mut slot = MemSlot::new(desc(0, 0x100)).unwrap();
        assert!(slot.write_track.is_empty());
        assert!(!slot.is_write_tracked(5));
        assert!(slot.remove_write_track(5).is_err());
        slot.add_write_track(5).unwrap();
        assert_eq!(slot.write_track.len(), 0x100);
        assert!(slot.is_write_tracked(5));
        slot.remove_write_track(5).unwrap();
        assert!(!slot.is_write_tracked(5));
    }

    #[test]
    fn test_slots_overlap_and_lookup() {
        let mut slots = MemSlots::new();
        slots.insert(MemSlot::new(desc(0, 0x100)).unwrap()).unwrap();
        let mut other = desc(0x80, 0x100);
        other.id = 1;
        assert!(slots.insert(MemSlot::new(other).unwrap()).is_err());
        other.as_id = 1;
        slots.insert(MemSlot::new(other).unwrap()).unwrap();

        assert_eq!(slots.lookup(0, 0x90).map(MemSlot::id), Some(0));
        assert_eq!(slots.lookup(1, 0x90).map(MemSlot::id), Some(1));
        assert!(slots.lookup(0, 0x100).is_none());
        assert_eq!(slots.generation(), 2);

        slots.remove(0).unwrap();
        assert!(slots.lookup(0, 0x90).is_none());
        assert_eq!(slots.generation(), 3);
    }
}

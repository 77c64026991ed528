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

//! Tearing down and write-protecting mappings.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use axerrno::{AxResult, ax_err, ax_err_type};
use page_table_entry::GenericPTE;

use super::{Mmu, MmuState};
use crate::hal::MmuHal;
use crate::level::{ENTRY_COUNT, Gfn, MAX_HUGEPAGE_LEVEL, PG_LEVEL_2M, PG_LEVEL_4K, gfn_to_index};
use crate::rmap::{RmapKey, SptepRef};
use crate::slot::{MemSlot, MemSlots, SlotId};
use crate::spte::{MMIO_GEN_MASK, Spte};
use crate::store::SpHandle;

impl<H: MmuHal> Mmu<H> {
    /// Clears entry `index` of `sp`, dropping its reverse-map entry or, for a
    /// table entry, the child page once nothing else references it.
    /// Returns whether a present translation was removed.
    pub(super) fn zap_spte(
        &self,
        st: &mut MmuState,
        slots: &MemSlots,
        sp: SpHandle,
        index: usize,
        invalid_list: &mut Vec<SpHandle>,
    ) -> bool {
        let page = st.store.page(sp);
        let (level, gfn, as_id) = (page.level(), page.gfn_at(index), page.role().as_id());
        let spte = page.spt().load(index);

        if !spte.is_shadow_present() {
            if spte.is_mmio() {
                page.spt().exchange(index, Spte::EMPTY);
            }
            return false;
        }

        if spte.is_last(level) {
            page.spt().exchange(index, Spte::EMPTY);
            match slots.lookup(as_id, gfn) {
                Some(slot) => {
                    st.rmap
                        .remove(RmapKey::new(slot, gfn, level), SptepRef::new(sp, index));
                }
                None => warn!("{:?} maps gfn {:#x} outside every memslot", spte, gfn),
            }
        } else if let Some(child) = st.store.page_by_hpa(spte.paddr()) {
            st.store.unlink(SptepRef::new(sp, index), child);
            let child_page = st.store.page(child);
            if child_page.parent_ptes.is_empty() && child_page.root_count() == 0 {
                self.zap_page(st, slots, child, invalid_list);
            }
        } else {
            error!("{:?} points at no shadow page", spte);
            page.spt().exchange(index, Spte::EMPTY);
        }
        true
    }

    /// Detaches `sp` from the table and zaps everything below it. The page
    /// goes on `invalid_list`, or is only marked invalid while it is still
    /// some vCPU's root.
    pub(super) fn zap_page(
        &self,
        st: &mut MmuState,
        slots: &MemSlots,
        sp: SpHandle,
        invalid_list: &mut Vec<SpHandle>,
    ) {
        let parents = core::mem::take(&mut st.store.page_mut(sp).parent_ptes);
        for sptep in parents {
            st.store
                .page(sptep.sp)
                .spt()
                .exchange(sptep.index as usize, Spte::EMPTY);
        }
        for index in 0..ENTRY_COUNT {
            self.zap_spte(st, slots, sp, index, invalid_list);
        }

        let page = st.store.page_mut(sp);
        if page.lpage_disallowed {
            page.lpage_disallowed = false;
            st.nx_lpage_splits.retain(|&h| h != sp);
        }
        self.counters.pages_zapped.fetch_add(1, Ordering::Relaxed);

        if st.store.page(sp).root_count() > 0 {
            debug!("zapped root {:?} still in use", sp);
            st.store.mark_invalid(sp);
        } else {
            invalid_list.push(sp);
        }
    }

    /// Finishes a batch of zaps: one flush, then the pages are evicted.
    pub(super) fn commit_zap(&self, st: &mut MmuState, invalid_list: Vec<SpHandle>) {
        if !invalid_list.is_empty() {
            self.flush_remote_tlbs();
            for sp in invalid_list {
                if let Err(err) = st.store.evict(sp) {
                    error!("failed to evict {:?}: {:?}", sp, err);
                }
            }
        }
        self.free_pending(st);
    }

    /// Zaps every leaf on the reverse-map list `key`.
    pub(super) fn zap_rmap(&self, st: &mut MmuState, key: RmapKey) -> bool {
        let entries = st.rmap.entries(key);
        for &sptep in &entries {
            st.store
                .page(sptep.sp)
                .spt()
                .exchange(sptep.index as usize, Spte::EMPTY);
            st.rmap.remove(key, sptep);
        }
        !entries.is_empty()
    }

    /// Removes write access from every leaf on `key`. Returns whether a
    /// writable translation was revoked.
    fn rmap_write_protect(st: &MmuState, key: RmapKey, pt_protect: bool) -> bool {
        let mut flush = false;
        st.rmap.for_each(key, |sptep| {
            let old = st
                .store
                .page(sptep.sp)
                .spt()
                .clear_bits(sptep.index as usize, Spte::write_protect_mask(pt_protect));
            flush |= old.is_writable();
        });
        flush
    }

    /// Write-protects every 4K page of `slot` selected by `mask`, relative to
    /// `gfn_offset`. Such pages may be made writable again locklessly.
    fn write_protect_masked(st: &MmuState, slot: &MemSlot, gfn_offset: u64, mut mask: u64) -> bool {
        let mut flush = false;
        while mask != 0 {
            let gfn = slot.base_gfn() + gfn_offset + mask.trailing_zeros() as u64;
            if !slot.contains(gfn) {
                break;
            }
            flush |= Self::rmap_write_protect(st, RmapKey::new(slot, gfn, PG_LEVEL_4K), false);
            mask &= mask - 1;
        }
        flush
    }

    /// Removes write access to `gfn` from every mapping of at least
    /// `min_level`. Returns whether any writable mapping existed; remote TLBs
    /// are flushed in that case.
    pub fn write_protect(&self, slot: SlotId, gfn: Gfn, min_level: u8) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(slot).filter(|s| s.contains(gfn)) else {
            warn!("write protecting gfn {:#x} outside slot {}", gfn, slot);
            return false;
        };
        let st = self.state.lock();
        let mut protected = false;
        for level in min_level.max(PG_LEVEL_4K)..=MAX_HUGEPAGE_LEVEL {
            protected |= Self::rmap_write_protect(&st, RmapKey::new(slot, gfn, level), true);
        }
        if protected {
            self.flush_remote_tlbs();
        }
        protected
    }

    fn with_slot_mut<R>(
        &self,
        id: SlotId,
        gfn: Gfn,
        f: impl FnOnce(&mut MemSlot) -> AxResult<R>,
    ) -> AxResult<R> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        if !slot.contains(gfn) {
            return ax_err!(InvalidInput, "gfn outside memory slot");
        }
        f(slot)
    }

    /// Adds a reason for mapping the regions around `gfn` with 4K pages only.
    pub fn disallow_lpage(&self, slot: SlotId, gfn: Gfn) -> AxResult {
        self.with_slot_mut(slot, gfn, |s| {
            s.disallow_lpage(gfn);
            Ok(())
        })
    }

    /// Drops a reason added by [`Mmu::disallow_lpage`].
    pub fn allow_lpage(&self, slot: SlotId, gfn: Gfn) -> AxResult {
        self.with_slot_mut(slot, gfn, |s| {
            s.allow_lpage(gfn);
            Ok(())
        })
    }

    /// Makes guest writes to `gfn` trap to the emulator.
    pub fn track_write(&self, slot: SlotId, gfn: Gfn) -> AxResult {
        self.with_slot_mut(slot, gfn, |s| {
            s.add_write_track(gfn)?;
            s.disallow_lpage(gfn);
            Ok(())
        })?;
        self.write_protect(slot, gfn, PG_LEVEL_4K);
        Ok(())
    }

    pub fn untrack_write(&self, slot: SlotId, gfn: Gfn) -> AxResult {
        self.with_slot_mut(slot, gfn, |s| {
            s.remove_write_track(gfn)?;
            s.allow_lpage(gfn);
            Ok(())
        })
    }

    /// Notes an emulated guest write to `gfn`. Shadow pages keyed at `gfn`
    /// that keep being written without being walked are zapped. Returns how
    /// many were.
    pub fn note_emulated_write(&self, as_id: usize, gfn: Gfn) -> usize {
        let slots = self.slots.read();
        let mut st = self.state.lock();
        let valid_gen = st.store.valid_gen();
        let mut invalid_list = Vec::new();
        let mut zapped = 0;

        for sp in st.store.pages_with_gfn(gfn) {
            if invalid_list.contains(&sp) {
                continue;
            }
            let page = st.store.page(sp);
            if page.role().as_id() != as_id
                || page.root_count() > 0
                || page.is_obsolete(valid_gen)
                || page.parent_ptes.is_empty()
            {
                continue;
            }
            if page.detect_write_flooding() {
                debug!("write flooding on {:?}, gfn {:#x}", sp, gfn);
                self.zap_page(&mut st, &slots, sp, &mut invalid_list);
                zapped += 1;
            }
        }
        self.commit_zap(&mut st, invalid_list);
        zapped
    }

    /// Zaps every mapping of `[start, end)` in address space `as_id`. Faults
    /// that looked up their backing memory before this call, or run before
    /// [`Mmu::invalidate_range_end`], are retried.
    pub fn invalidate_range_start(&self, as_id: usize, start: Gfn, end: Gfn) -> bool {
        self.invalidate_in_progress.fetch_add(1, Ordering::SeqCst);

        let slots = self.slots.read();
        let mut st = self.state.lock();
        let mut flush = false;
        for slot in slots.iter().filter(|s| s.as_id() == as_id) {
            let lo = start.max(slot.base_gfn());
            let hi = end.min(slot.end_gfn());
            if lo >= hi {
                continue;
            }
            for key in st.rmap.slot_keys(slot.id()) {
                let first = gfn_to_index(lo, slot.base_gfn(), key.level);
                let last = gfn_to_index(hi - 1, slot.base_gfn(), key.level);
                if (first..=last).contains(&key.index) {
                    flush |= self.zap_rmap(&mut st, key);
                }
            }
        }
        if flush {
            self.flush_remote_tlbs_with_address(start, end - start);
        }
        debug!("invalidated gfn [{:#x}, {:#x}) of as {}", start, end, as_id);
        flush
    }

    pub fn invalidate_range_end(&self) {
        self.invalidate_seq.fetch_add(1, Ordering::Release);
        let ended = self.invalidate_in_progress.fetch_update(
            Ordering::Release,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
        if ended.is_err() {
            error!("unbalanced invalidate_range_end");
        }
    }

    /// Host-side unmap of `[start, end)`.
    pub fn invalidate_gfn_range(&self, as_id: usize, start: Gfn, end: Gfn) -> bool {
        let flushed = self.invalidate_range_start(as_id, start, end);
        self.invalidate_range_end();
        flushed
    }

    /// Makes every existing page obsolete and zaps all roots. vCPUs notice
    /// on their next fault and load a new root.
    pub fn zap_all_fast(&self) {
        let slots = self.slots.read();
        self.zap_all_locked(&slots);
    }

    /// Runs after every change of the memslot generation, with the memslot
    /// lock held. MMIO entries keep only the low bits of the generation, so
    /// all of them are dropped whenever those bits wrap to zero.
    pub(super) fn memslots_changed(&self, slots: &MemSlots) {
        if slots.generation() & MMIO_GEN_MASK == 0 {
            info!(
                "memslot generation {:#x} wrapped, dropping MMIO entries",
                slots.generation()
            );
            self.zap_all_locked(slots);
        }
    }

    fn zap_all_locked(&self, slots: &MemSlots) {
        let mut st = self.state.lock();
        let valid_gen = st.store.bump_valid_gen();
        debug!("zapping all shadow pages, generation {}", valid_gen);

        let mut invalid_list = Vec::new();
        for sp in st.store.handles() {
            let page = st.store.page(sp);
            if page.parent_ptes.is_empty() && !page.is_invalid() && !invalid_list.contains(&sp) {
                self.zap_page(&mut st, slots, sp, &mut invalid_list);
            }
        }
        self.commit_zap(&mut st, invalid_list);
    }

    /// Turns the NX huge page workaround on or off. Existing mappings are
    /// rebuilt under the new policy.
    pub fn set_nx_huge_pages(&self, enabled: bool) {
        if self.nx_huge_pages.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!(
            "NX huge pages {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.zap_all_fast();
    }

    /// Zaps a share of the pages that exist only because an executable huge
    /// page was split, so that they can be mapped huge again. Returns how
    /// many were zapped.
    pub fn recover_nx_lpages(&self) -> usize {
        let ratio = self.config.nx_recovery_ratio as usize;
        if ratio == 0 {
            return 0;
        }
        let slots = self.slots.read();
        let mut st = self.state.lock();
        let to_zap = st.nx_lpage_splits.len().div_ceil(ratio);

        let mut invalid_list = Vec::new();
        let mut zapped = 0;
        while zapped < to_zap {
            let Some(sp) = st.nx_lpage_splits.pop_front() else {
                break;
            };
            self.zap_page(&mut st, &slots, sp, &mut invalid_list);
            zapped += 1;
        }
        self.commit_zap(&mut st, invalid_list);
        if zapped > 0 {
            debug!("recovered {} NX huge pages", zapped);
        }
        zapped
    }

    /// Starts or stops logging writes to memslot `id`.
    pub fn set_dirty_logging(&self, id: SlotId, enable: bool) -> AxResult {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        if slot.is_dirty_logging() == enable {
            return Ok(());
        }
        slot.set_dirty_logging(enable);
        slots.bump_generation();
        self.memslots_changed(&slots);

        let Some(slot) = slots.get(id) else {
            return ax_err!(NotFound);
        };
        let mut st = self.state.lock();
        let flush = if enable {
            // Every leaf has to fault once more so that the write is logged.
            st.rmap
                .slot_keys(id)
                .into_iter()
                .fold(false, |flush, key| {
                    Self::rmap_write_protect(&st, key, false) | flush
                })
        } else {
            self.zap_collapsible_sptes(&mut st, slot)
        };
        if flush {
            self.flush_remote_tlbs();
        }
        info!(
            "slot {}: dirty logging {}",
            id,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Zaps 4K leaves that could be part of a huge mapping again.
    fn zap_collapsible_sptes(&self, st: &mut MmuState, slot: &MemSlot) -> bool {
        if slot.host_level() == PG_LEVEL_4K {
            return false;
        }
        let mut flush = false;
        for key in st.rmap.slot_keys(slot.id()) {
            let gfn = slot.base_gfn() + key.index as u64;
            if key.level == PG_LEVEL_4K && slot.lpage_allowed(gfn, PG_LEVEL_2M) {
                flush |= self.zap_rmap(st, key);
            }
        }
        flush
    }

    /// Write-protects the pages selected by `mask` again after their dirty
    /// bits were harvested.
    pub fn clear_dirty_log(&self, id: SlotId, gfn_offset: u64, mask: u64) -> AxResult {
        let slots = self.slots.read();
        let slot = slots
            .get(id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        if !slot.is_dirty_logging() {
            return ax_err!(BadState, "dirty logging is off");
        }
        if gfn_offset >= slot.npages() {
            return ax_err!(InvalidInput, "gfn offset outside memory slot");
        }
        let st = self.state.lock();
        if Self::write_protect_masked(&st, slot, gfn_offset, mask) {
            self.flush_remote_tlbs();
        }
        Ok(())
    }

    /// Returns and resets the dirty bitmap of memslot `id`. The pages found
    /// dirty are write-protected again.
    pub fn get_dirty_log(&self, id: SlotId) -> AxResult<Vec<u64>> {
        let slots = self.slots.read();
        let slot = slots
            .get(id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such memory slot"))?;
        if !slot.is_dirty_logging() {
            return ax_err!(BadState, "dirty logging is off");
        }
        let log = slot.take_dirty_log();

        let st = self.state.lock();
        let mut flush = false;
        for (i, &mask) in log.iter().enumerate() {
            flush |= Self::write_protect_masked(&st, slot, i as u64 * 64, mask);
        }
        if flush {
            self.flush_remote_tlbs();
        }
        Ok(log)
    }
}

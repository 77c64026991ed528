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

//! Nested page fault resolution.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use page_table_entry::{GenericPTE, MappingFlags};

use super::{Mmu, MmuRoot, MmuState};
use crate::fault::{FaultState, PageFault, PfOutcome};
use crate::frame::PageCache;
use crate::hal::MmuHal;
use crate::hugepage::HugePageAdvisor;
use crate::level::{PG_LEVEL_4K, hpage_base, level_index, pages_per_hpage};
use crate::rmap::{RmapKey, SptepRef};
use crate::slot::MemSlots;
use crate::spte::{MMIO_GEN_MASK, Spte};
use crate::store::SpHandle;

impl<H: MmuHal> Mmu<H> {
    /// Resolves one nested page fault taken while running on `root`.
    ///
    /// Tables are allocated from `cache`, which the caller fills beforehand.
    /// Every path ends in a terminal [`PfOutcome`]; nothing here fails.
    pub fn resolve_fault(
        &self,
        cache: &mut PageCache,
        root: &MmuRoot,
        fault: &mut PageFault,
    ) -> PfOutcome {
        if !fault.is_well_formed() {
            warn!(
                "malformed fault at {:?}: {:?}",
                fault.addr, fault.error_code
            );
            return fault.finish(PfOutcome::Invalid);
        }
        fault.max_level = fault.max_level.min(self.config.max_huge_level);

        if fault.rsvd {
            match self.handle_mmio_fault(root, fault) {
                PfOutcome::Continue => {}
                outcome => return fault.finish(outcome),
            }
        }

        if fault.present {
            match self.fast_page_fault(root, fault) {
                PfOutcome::Invalid => {}
                outcome => return fault.finish(outcome),
            }
        }

        let outcome = self.direct_page_fault(cache, root, fault);
        fault.finish(outcome)
    }

    /// A reserved-bit fault is how the hardware reports a hit on an MMIO
    /// entry.
    fn handle_mmio_fault(&self, root: &MmuRoot, fault: &PageFault) -> PfOutcome {
        // Sampled before the walk: an entry older than this generation is
        // either stale or already zapped by a generation wrap.
        let generation = self.slots.read().generation() & MMIO_GEN_MASK;
        self.walk_lockless_begin();
        let (_, _, _, spte) = self.lockless_leaf(root, fault.gfn);
        self.walk_lockless_end();

        if !spte.is_mmio() {
            // Zapped or replaced after the hardware saw it.
            debug!(
                "reserved bit fault at {:?} on non-MMIO entry {:?}, retrying",
                fault.addr, spte
            );
            return PfOutcome::Retry;
        }
        if spte.mmio_generation() == generation {
            PfOutcome::Emulate
        } else {
            // Created under an older memslot layout; the slow path replaces it.
            PfOutcome::Continue
        }
    }

    /// Handles faults that only need a leaf made writable again, or that a
    /// concurrent fault already fixed. Returns `Invalid` if the slow path has
    /// to run.
    fn fast_page_fault(&self, root: &MmuRoot, fault: &mut PageFault) -> PfOutcome {
        let mut outcome = PfOutcome::Invalid;
        let mut retries = 0;

        self.walk_lockless_begin();
        loop {
            let (table, index, level, spte) = self.lockless_leaf(root, fault.gfn);
            if !spte.is_shadow_present() || !spte.is_last(level) {
                break;
            }
            if spte.is_access_allowed(fault.write, fault.exec) {
                outcome = PfOutcome::Spurious;
                break;
            }
            if !fault.write || !spte.can_be_made_writable() {
                break;
            }

            let slots = self.slots.read();
            let Some(slot) = slots.lookup(root.as_id, fault.gfn) else {
                break;
            };
            // Huge pages of a dirty-logged slot are split by the slow path.
            if level > PG_LEVEL_4K && slot.is_dirty_logging() {
                break;
            }
            if table
                .compare_exchange(index, spte, spte.with_writable())
                .is_ok()
            {
                slot.mark_dirty(fault.gfn);
                fault.fast_fixed = true;
                outcome = PfOutcome::Fixed;
                break;
            }

            retries += 1;
            if retries >= self.config.max_fast_retries {
                warn!("fast page fault at {:?} retried too many times", fault.addr);
                outcome = PfOutcome::Retry;
                break;
            }
        }
        self.walk_lockless_end();
        outcome
    }

    fn direct_page_fault(
        &self,
        cache: &mut PageCache,
        root: &MmuRoot,
        fault: &mut PageFault,
    ) -> PfOutcome {
        fault.mmu_seq = self.invalidate_seq.load(Ordering::Acquire);

        let slots = self.slots.read();
        if let Some(outcome) = Self::faultin(&slots, root.as_id, fault) {
            return outcome;
        }

        let Some(mut st) = self.lock_state() else {
            debug!("table lock contended, fault at {:?} retried", fault.addr);
            return PfOutcome::Retry;
        };
        if !st.store.contains(root.sp)
            || st.store.page(root.sp).is_obsolete(st.store.valid_gen())
        {
            return PfOutcome::Invalid;
        }
        if self.is_invalidate_retry(fault.mmu_seq) {
            return PfOutcome::Retry;
        }

        let slot = fault.slot.and_then(|id| slots.get(id));
        HugePageAdvisor::hugepage_adjust(fault, slot);
        self.direct_map(&mut st, &slots, cache, root, fault)
    }

    /// Looks up the memory backing the faulting gfn. Returns an outcome if
    /// the fault cannot be resolved by a mapping.
    fn faultin(slots: &MemSlots, as_id: usize, fault: &mut PageFault) -> Option<PfOutcome> {
        let Some(slot) = slots.lookup(as_id, fault.gfn) else {
            // No memory here: cache the gfn as MMIO.
            fault.slot = None;
            fault.max_level = PG_LEVEL_4K;
            return None;
        };
        if fault.write && slot.is_readonly() {
            return Some(PfOutcome::Emulate);
        }
        fault.slot = Some(slot.id());
        fault.pfn = slot.gfn_to_pfn(fault.gfn);
        fault.hva = slot.gfn_to_hva(fault.gfn).as_usize();
        fault.map_writable = !slot.is_readonly();
        None
    }

    /// Whether a host-side invalidation may have changed the backing memory
    /// since `mmu_seq` was sampled.
    fn is_invalidate_retry(&self, mmu_seq: u64) -> bool {
        self.invalidate_in_progress.load(Ordering::Acquire) != 0
            || self.invalidate_seq.load(Ordering::Acquire) != mmu_seq
    }

    fn direct_map(
        &self,
        st: &mut MmuState,
        slots: &MemSlots,
        cache: &mut PageCache,
        root: &MmuRoot,
        fault: &mut PageFault,
    ) -> PfOutcome {
        let mut invalid_list = Vec::new();
        // Topmost page created by this walk; zapping it undoes the walk.
        let mut created: Option<SpHandle> = None;
        let mut sp = root.sp;
        let mut level = root.level;

        fault.transition(FaultState::Walking);
        let index = loop {
            let index = level_index(fault.gfn, level);
            let spte = st.store.page(sp).spt().load(index);

            if fault.nx_huge_page_workaround_enabled && self.is_nx_split(st, spte) {
                HugePageAdvisor::disallowed_hugepage_adjust(fault, spte, level);
            }
            if level == fault.goal_level {
                break index;
            }

            if spte.is_shadow_present() && !spte.is_large() {
                let Some(child) = st.store.page_by_hpa(spte.paddr()) else {
                    error!("{:?} at level {} points at no shadow page", spte, level);
                    self.commit_zap(st, invalid_list);
                    return PfOutcome::Invalid;
                };
                st.store.page(child).clear_write_flooding();
                sp = child;
                level -= 1;
                continue;
            }
            if spte.is_shadow_present() {
                // A huge leaf is in the way of a smaller mapping.
                let base = st.store.page(sp).gfn_at(index);
                self.zap_spte(st, slots, sp, index, &mut invalid_list);
                self.flush_remote_tlbs_with_address(base, pages_per_hpage(level));
            }

            fault.transition(FaultState::Allocating);
            let child = match st.store.get_or_create_child(&self.hal, cache, sp, index) {
                Ok((child, is_new)) => {
                    if is_new && created.is_none() {
                        created = Some(child);
                    }
                    child
                }
                Err(err) => {
                    warn!(
                        "fault at {:?}: {:?} allocating a level {} table",
                        fault.addr,
                        err,
                        level - 1
                    );
                    if let Some(top) = created {
                        self.zap_page(st, slots, top, &mut invalid_list);
                    }
                    self.commit_zap(st, invalid_list);
                    return PfOutcome::Retry;
                }
            };
            if fault.huge_page_disallowed {
                Self::account_nx_huge_page(st, child, fault.req_level >= level);
            }
            fault.transition(FaultState::Walking);
            sp = child;
            level -= 1;
        };
        fault.transition(FaultState::LevelClamped);

        fault.transition(FaultState::Installing);
        let outcome = if fault.slot.is_some() {
            self.mmu_set_spte(st, slots, sp, index, fault, &mut invalid_list)
        } else {
            self.set_mmio_spte(st, slots, sp, index, fault, &mut invalid_list)
        };
        self.commit_zap(st, invalid_list);
        outcome
    }

    /// Whether `spte` points at a table created by splitting an executable
    /// huge page.
    fn is_nx_split(&self, st: &MmuState, spte: Spte) -> bool {
        spte.is_shadow_present()
            && !spte.is_large()
            && st
                .store
                .page_by_hpa(spte.paddr())
                .is_some_and(|child| st.store.page(child).is_lpage_disallowed())
    }

    /// Marks `sp` as created only because a huge page was not allowed to be
    /// executable. If a huge page would otherwise have been possible, it
    /// becomes a candidate for recovery.
    fn account_nx_huge_page(st: &mut MmuState, sp: SpHandle, huge_page_possible: bool) {
        let page = st.store.page_mut(sp);
        if page.lpage_disallowed {
            return;
        }
        page.lpage_disallowed = true;
        if huge_page_possible {
            st.nx_lpage_splits.push_back(sp);
        }
    }

    /// Installs the leaf for `fault` in entry `index` of `sp`.
    fn mmu_set_spte(
        &self,
        st: &mut MmuState,
        slots: &MemSlots,
        sp: SpHandle,
        index: usize,
        fault: &PageFault,
        invalid_list: &mut Vec<SpHandle>,
    ) -> PfOutcome {
        let level = fault.goal_level;
        let Some(slot) = fault.slot.and_then(|id| slots.get(id)) else {
            error!("fault at {:?} lost its memslot", fault.addr);
            return PfOutcome::Retry;
        };

        let old = st.store.page(sp).spt().load(index);
        // Speculative faults only fill empty entries.
        if fault.prefetch && old.is_shadow_present() {
            return PfOutcome::Spurious;
        }
        let same_leaf =
            old.is_shadow_present() && old.is_last(level) && old.pfn() == fault.pfn;
        let mut flush = false;
        if old.is_shadow_present() && !same_leaf {
            // Either a table where the huge leaf goes, or a different frame.
            flush |= self.zap_spte(st, slots, sp, index, invalid_list);
        }

        // A write-tracked gfn is never mapped writable.
        let wrprot = fault.map_writable && slot.is_write_tracked(fault.gfn);
        let writable = fault.map_writable && !wrprot;

        let mut flags = MappingFlags::READ | MappingFlags::USER;
        if level == PG_LEVEL_4K || !self.nx_huge_pages_enabled() {
            flags |= MappingFlags::EXECUTE;
        }
        if writable {
            flags |= MappingFlags::WRITE;
        }
        let mut spte = Spte::new_leaf(fault.pfn, level, flags, fault.map_writable);
        if writable {
            if fault.write {
                spte = spte.with_writable();
                slot.mark_dirty(fault.gfn);
            } else if slot.is_dirty_logging() {
                // The first write has to fault so that it gets logged.
                spte = Spte::from_bits(spte.raw() & !Spte::write_protect_mask(false));
            }
        }

        if fault.prefetch {
            // Left for the guest's first real access to set.
            spte = spte.without_accessed();
        }

        let mut outcome = PfOutcome::Fixed;
        if same_leaf && spte.is_subsumed_by(old) {
            outcome = PfOutcome::Spurious;
        } else {
            let prev = st.store.page(sp).spt().exchange(index, spte);
            if same_leaf {
                flush |= prev.is_writable() && !spte.is_writable();
            } else {
                st.rmap
                    .add(RmapKey::new(slot, fault.gfn, level), SptepRef::new(sp, index));
            }
            #[cfg(feature = "tracing")]
            trace!(
                "set spte {:?} for gfn {:#x} at level {}",
                spte, fault.gfn, level
            );
        }

        if flush {
            self.flush_remote_tlbs_with_address(
                hpage_base(fault.gfn, level),
                pages_per_hpage(level),
            );
        }
        if wrprot && fault.write {
            outcome = PfOutcome::Emulate;
        }
        outcome
    }

    /// Caches the absence of memory at the faulting gfn.
    fn set_mmio_spte(
        &self,
        st: &mut MmuState,
        slots: &MemSlots,
        sp: SpHandle,
        index: usize,
        fault: &PageFault,
        invalid_list: &mut Vec<SpHandle>,
    ) -> PfOutcome {
        if self.zap_spte(st, slots, sp, index, invalid_list) {
            self.flush_remote_tlbs_with_address(fault.gfn, 1);
        }
        let spte = Spte::new_mmio(fault.gfn, slots.generation());
        st.store.page(sp).spt().install(index, spte);
        self.counters.mmio_sptes.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        trace!("set MMIO spte {:?}", spte);
        PfOutcome::Emulate
    }
}

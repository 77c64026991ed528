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

//! Huge page policy: how large a mapping a fault may install.

use crate::fault::PageFault;
use crate::level::{Gfn, PG_LEVEL_4K, pages_per_hpage};
use crate::slot::MemSlot;
use crate::spte::Spte;

/// Whether executable huge pages are split to work around the
/// instruction-TLB multihit erratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NxHugePages {
    Off,
    Force,
    /// Enabled only if the host reports the erratum.
    Auto,
}

impl NxHugePages {
    pub fn resolve(self, host_vulnerable: bool) -> bool {
        match self {
            Self::Off => false,
            Self::Force => true,
            Self::Auto => host_vulnerable,
        }
    }
}

/// Slot metadata that decides huge page eligibility around one gfn.
#[derive(Debug, Clone, Copy)]
pub struct SlotMeta<'a> {
    pub slot: &'a MemSlot,
    pub gfn: Gfn,
}

pub struct HugePageAdvisor;

impl HugePageAdvisor {
    /// Largest level at most `max_level` that both the slot metadata and the
    /// host mapping allow for `gfn`.
    pub fn max_mapping_level(slot: &MemSlot, gfn: Gfn, max_level: u8) -> u8 {
        let mut level = max_level;
        while level > PG_LEVEL_4K && !slot.lpage_allowed(gfn, level) {
            level -= 1;
        }
        level.min(slot.host_level())
    }

    /// Goal level for a request of `req_level`. Never fails: the worst case
    /// is a 4K mapping.
    pub fn clamp(req_level: u8, meta: Option<SlotMeta>, workaround_enabled: bool) -> u8 {
        let Some(meta) = meta else {
            return PG_LEVEL_4K;
        };
        if workaround_enabled || meta.slot.is_dirty_logging() {
            return PG_LEVEL_4K;
        }
        Self::max_mapping_level(meta.slot, meta.gfn, req_level).max(PG_LEVEL_4K)
    }

    /// Computes `req_level` and `goal_level` of `fault` and aligns its pfn to
    /// the goal.
    pub fn hugepage_adjust(fault: &mut PageFault, slot: Option<&MemSlot>) {
        fault.huge_page_disallowed = fault.exec && fault.nx_huge_page_workaround_enabled;

        if fault.max_level == PG_LEVEL_4K {
            return;
        }
        let Some(slot) = slot else {
            return;
        };
        if slot.is_dirty_logging() {
            return;
        }

        fault.req_level = Self::max_mapping_level(slot, fault.gfn, fault.max_level);
        if fault.req_level == PG_LEVEL_4K {
            return;
        }

        fault.goal_level = Self::clamp(
            fault.req_level,
            Some(SlotMeta {
                slot,
                gfn: fault.gfn,
            }),
            fault.huge_page_disallowed,
        );
        let mask = pages_per_hpage(fault.goal_level) - 1;
        fault.pfn &= !mask;
    }

    /// Lowers the goal by one level when a huge page is disallowed for this
    /// fault and the walk already found a table at the goal level, so that
    /// the existing smaller mappings are kept.
    pub fn disallowed_hugepage_adjust(fault: &mut PageFault, spte: Spte, cur_level: u8) {
        if cur_level > PG_LEVEL_4K
            && cur_level == fault.goal_level
            && spte.is_shadow_present()
            && !spte.is_large()
        {
            // The walk continues one level down, where the pfn has to carry
            // the gfn bits of that level.
            let page_mask = pages_per_hpage(cur_level) - pages_per_hpage(cur_level - 1);
            fault.pfn |= fault.gfn & page_mask;
            fault.goal_level -= 1;
        }
    }
}

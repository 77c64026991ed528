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

//! Reverse map from guest frames to the leaf entries mapping them.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::level::{Gfn, gfn_to_index};
use crate::slot::{MemSlot, SlotId};
use crate::store::SpHandle;

/// Location of one entry: the shadow page holding it and its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SptepRef {
    pub sp: SpHandle,
    pub index: u16,
}

impl SptepRef {
    pub fn new(sp: SpHandle, index: usize) -> Self {
        Self {
            sp,
            index: index as u16,
        }
    }
}

/// One reverse-map list: all leaves of one size mapping one guest region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RmapKey {
    pub slot: SlotId,
    pub level: u8,
    /// Index of the `level`-sized region inside the slot.
    pub index: usize,
}

impl RmapKey {
    pub fn new(slot: &MemSlot, gfn: Gfn, level: u8) -> Self {
        Self {
            slot: slot.id(),
            level,
            index: gfn_to_index(gfn, slot.base_gfn(), level),
        }
    }
}

/// Serialized by the table lock, like every other structure it points into.
#[derive(Debug, Default)]
pub struct ReverseMapIndex {
    heads: BTreeMap<RmapKey, Vec<SptepRef>>,
}

impl ReverseMapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `sptep` maps the region `key`. Returns the new list length.
    pub fn add(&mut self, key: RmapKey, sptep: SptepRef) -> usize {
        let head = self.heads.entry(key).or_default();
        debug_assert!(!head.contains(&sptep), "duplicate rmap entry {:?}", sptep);
        head.push(sptep);
        head.len()
    }

    /// Forgets that `sptep` maps `key`. Returns whether it was present.
    pub fn remove(&mut self, key: RmapKey, sptep: SptepRef) -> bool {
        let Some(head) = self.heads.get_mut(&key) else {
            warn!("rmap {:?}: removing {:?} from an empty list", key, sptep);
            return false;
        };
        let Some(pos) = head.iter().position(|e| *e == sptep) else {
            warn!("rmap {:?}: {:?} not found", key, sptep);
            return false;
        };
        head.swap_remove(pos);
        if head.is_empty() {
            self.heads.remove(&key);
        }
        true
    }

    pub fn for_each(&self, key: RmapKey, mut f: impl FnMut(SptepRef)) {
        if let Some(head) = self.heads.get(&key) {
            head.iter().copied().for_each(&mut f);
        }
    }

    /// Entries currently mapping `key`.
    pub fn entries(&self, key: RmapKey) -> Vec<SptepRef> {
        self.heads.get(&key).cloned().unwrap_or_default()
    }

    pub fn count(&self, key: RmapKey) -> usize {
        self.heads.get(&key).map_or(0, Vec::len)
    }

    /// All lists belonging to `slot`, in key order.
    pub fn slot_keys(&self, slot: SlotId) -> Vec<RmapKey> {
        self.heads
            .keys()
            .filter(|k| k.slot == slot)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heads.values().map(Vec::len).sum()
    }
}

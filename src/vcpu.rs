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

use axerrno::AxResult;

use crate::GuestPhysAddr;
use crate::fault::{ErrorCode, PageFault, PfOutcome};
use crate::frame::PageCache;
use crate::hal::MmuHal;
use crate::mmu::{Mmu, MmuRoot};

/// Nested page fault counters of one vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuMmuStats {
    pub pf_taken: u64,
    pub pf_fixed: u64,
    pub pf_emulate: u64,
    pub pf_spurious: u64,
    pub pf_fast: u64,
}

/// The per-vCPU side of the nested MMU: the root the vCPU runs on and the
/// frames set aside for its faults.
#[derive(Debug)]
pub struct VcpuMmu {
    as_id: usize,
    root: Option<MmuRoot>,
    cache: PageCache,
    stats: VcpuMmuStats,
}

impl VcpuMmu {
    pub const fn new(as_id: usize) -> Self {
        Self {
            as_id,
            root: None,
            cache: PageCache::new(),
            stats: VcpuMmuStats {
                pf_taken: 0,
                pf_fixed: 0,
                pf_emulate: 0,
                pf_spurious: 0,
                pf_fast: 0,
            },
        }
    }

    pub fn stats(&self) -> VcpuMmuStats {
        self.stats
    }

    pub fn root(&self) -> Option<&MmuRoot> {
        self.root.as_ref()
    }

    /// Switches the vCPU to another address space, e.g. on SMM entry.
    pub fn set_as_id<H: MmuHal>(&mut self, mmu: &Mmu<H>, as_id: usize) {
        if as_id != self.as_id {
            self.unload_root(mmu);
            self.as_id = as_id;
        }
    }

    /// Loads a root if the vCPU has none.
    pub fn reload<H: MmuHal>(&mut self, mmu: &Mmu<H>) -> AxResult<&MmuRoot> {
        let root = match self.root.take() {
            Some(root) => root,
            None => mmu.load_root(self.as_id)?,
        };
        Ok(self.root.insert(root))
    }

    pub fn unload_root<H: MmuHal>(&mut self, mmu: &Mmu<H>) {
        if let Some(root) = self.root.take() {
            mmu.put_root(root);
        }
    }

    /// Releases the root and the cached frames.
    pub fn destroy<H: MmuHal>(&mut self, mmu: &Mmu<H>) {
        self.unload_root(mmu);
        self.cache.free_all(mmu.hal());
    }

    /// Handles a nested page fault at `gpa`.
    ///
    /// A fault that finds its root obsolete reloads the root and is handled
    /// once more. Prefetch faults only count towards `pf_fixed`.
    pub fn do_page_fault<H: MmuHal>(
        &mut self,
        mmu: &Mmu<H>,
        gpa: GuestPhysAddr,
        error_code: ErrorCode,
        prefetch: bool,
    ) -> PfOutcome {
        if !prefetch {
            self.stats.pf_taken += 1;
        }

        let mut outcome = PfOutcome::Retry;
        for _ in 0..2 {
            if let Err(err) = self.reload(mmu) {
                warn!("no root for fault at {:?}: {:?}", gpa, err);
                return PfOutcome::Retry;
            }
            if let Err(err) = self.cache.topup(mmu.hal(), mmu.config().walk_cache_min()) {
                warn!("page cache topup for fault at {:?}: {:?}", gpa, err);
                return PfOutcome::Retry;
            }
            let Some(root) = self.root.as_ref() else {
                return PfOutcome::Retry;
            };

            let mut fault =
                PageFault::new(gpa, error_code, prefetch, mmu.nx_huge_pages_enabled());
            outcome = mmu.resolve_fault(&mut self.cache, root, &mut fault);
            if fault.fast_fixed {
                self.stats.pf_fast += 1;
            }
            if outcome == PfOutcome::Invalid && mmu.is_root_obsolete(root) {
                self.unload_root(mmu);
                continue;
            }
            break;
        }

        if outcome == PfOutcome::Fixed {
            self.stats.pf_fixed += 1;
        }
        if !prefetch {
            match outcome {
                PfOutcome::Emulate => self.stats.pf_emulate += 1,
                PfOutcome::Spurious => self.stats.pf_spurious += 1,
                _ => {}
            }
        }
        outcome
    }
}

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

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::GuestPhysAddr;
use crate::level::{Gfn, MAX_HUGEPAGE_LEVEL, PG_LEVEL_4K, Pfn, gpa_to_gfn};
use crate::slot::SlotId;

bitflags! {
    /// Error code reported with a nested page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorCode: u32 {
        /// The translation was present; the fault is a permission violation.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        /// A reserved bit was set in a paging-structure entry.
        const RSVD = 1 << 3;
        /// The access was an instruction fetch.
        const FETCH = 1 << 4;
    }
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Result of one attempt to resolve a fault.
    ///
    /// All values are non-negative so they never collide with error numbers,
    /// and `Continue` is zero.
    pub enum PfOutcome {
        /// Nothing decided yet; keep handling the fault.
        Continue = 0,
        /// Transient condition; let the guest fault again.
        Retry = 1,
        /// The access cannot be satisfied by a mapping; emulate the instruction.
        Emulate = 2,
        /// The structure walked is stale; the caller must rebuild it.
        Invalid = 3,
        /// The faulting translation has been installed.
        Fixed = 4,
        /// The translation was already there, e.g. installed by another vCPU.
        Spurious = 5,
    }
}

impl PfOutcome {
    pub fn is_terminal(self) -> bool {
        self != Self::Continue
    }
}

/// Where a fault is in its resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    Initial,
    Classified,
    Walking,
    Allocating,
    LevelClamped,
    Installing,
    Done(PfOutcome),
}

/// Descriptor of one nested page fault, alive for one resolution.
#[derive(Debug, Clone)]
pub struct PageFault {
    // Arguments.
    pub addr: GuestPhysAddr,
    pub error_code: ErrorCode,
    /// Speculative fault: never replaces a present entry and installs
    /// leaves with the accessed bit clear.
    pub prefetch: bool,

    // Derived from the error code.
    pub exec: bool,
    pub write: bool,
    pub present: bool,
    pub rsvd: bool,
    pub user: bool,

    // Derived from MMU state.
    pub is_tdp: bool,
    pub nx_huge_page_workaround_enabled: bool,

    /// Whether a mapping larger than 4K is forbidden for this fault.
    pub huge_page_disallowed: bool,
    /// Largest page size that may be created for this fault.
    pub max_level: u8,
    /// Page size allowed by `max_level` and the host mapping.
    pub req_level: u8,
    /// Page size that will be created.
    pub goal_level: u8,

    pub gfn: Gfn,
    pub slot: Option<SlotId>,

    // Results of looking up the backing memory.
    pub pfn: Pfn,
    pub hva: usize,
    pub map_writable: bool,

    /// Invalidation sequence observed before the backing memory was looked up.
    pub(crate) mmu_seq: u64,
    /// Resolved by the lockless path.
    pub(crate) fast_fixed: bool,
    state: FaultState,
}

impl PageFault {
    pub fn new(
        addr: GuestPhysAddr,
        error_code: ErrorCode,
        prefetch: bool,
        nx_huge_page_workaround_enabled: bool,
    ) -> Self {
        let mut fault = Self {
            addr,
            error_code,
            prefetch,
            exec: error_code.contains(ErrorCode::FETCH),
            write: error_code.contains(ErrorCode::WRITE),
            present: error_code.contains(ErrorCode::PRESENT),
            rsvd: error_code.contains(ErrorCode::RSVD),
            user: error_code.contains(ErrorCode::USER),
            is_tdp: true,
            nx_huge_page_workaround_enabled,
            huge_page_disallowed: false,
            max_level: MAX_HUGEPAGE_LEVEL,
            req_level: PG_LEVEL_4K,
            goal_level: PG_LEVEL_4K,
            gfn: gpa_to_gfn(addr.as_usize()),
            slot: None,
            pfn: 0,
            hva: 0,
            map_writable: false,
            mmu_seq: 0,
            fast_fixed: false,
            state: FaultState::Initial,
        };
        fault.transition(FaultState::Classified);
        fault
    }

    /// Whether the error code describes an access the hardware can report.
    ///
    /// Reserved-bit faults only come from present entries, and an instruction
    /// fetch is never a write.
    pub fn is_well_formed(&self) -> bool {
        !(self.rsvd && !self.present) && !(self.exec && self.write)
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: FaultState) {
        #[cfg(feature = "tracing")]
        trace!("fault {:?}: {:?} -> {:?}", self.addr, self.state, next);
        self.state = next;
    }

    /// Records the terminal state and hands the outcome back.
    pub(crate) fn finish(&mut self, outcome: PfOutcome) -> PfOutcome {
        self.transition(FaultState::Done(outcome));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let fault = PageFault::new(
            GuestPhysAddr::from(0x1000_0000),
            ErrorCode::WRITE | ErrorCode::USER,
            false,
            false,
        );
        assert!(fault.write);
        assert!(fault.user);
        assert!(!fault.exec);
        assert!(!fault.present);
        assert_eq!(fault.gfn, 0x10000);
        assert_eq!(fault.max_level, MAX_HUGEPAGE_LEVEL);
        assert_eq!(fault.goal_level, PG_LEVEL_4K);
        assert_eq!(fault.state(), FaultState::Classified);
        assert!(fault.is_well_formed());
    }

    #[test]
    fn test_malformed_error_codes() {
        let rsvd = PageFault::new(GuestPhysAddr::from(0), ErrorCode::RSVD, false, false);
        assert!(!rsvd.is_well_formed());

        let rsvd_present = PageFault::new(
            GuestPhysAddr::from(0),
            ErrorCode::RSVD | ErrorCode::PRESENT,
            false,
            false,
        );
        assert!(rsvd_present.is_well_formed());

        let fetch_write = PageFault::new(
            GuestPhysAddr::from(0),
            ErrorCode::FETCH | ErrorCode::WRITE,
            false,
            false,
        );
        assert!(!fetch_write.is_well_formed());
    }

    #[test]
    fn test_outcome_values() {
        assert_eq!(u8::from(PfOutcome::Continue), 0);
        assert_eq!(PfOutcome::try_from(4u8), Ok(PfOutcome::Fixed));
        assert_eq!(PfOutcome::try_from(6u8), Err(6));
        assert!(!PfOutcome::Continue.is_terminal());
        assert!(PfOutcome::Spurious.is_terminal());
    }

    #[test]
    fn test_finish_records_state() {
        let mut fault = PageFault::new(GuestPhysAddr::from(0), ErrorCode::empty(), true, false);
        assert_eq!(fault.finish(PfOutcome::Retry), PfOutcome::Retry);
        assert_eq!(fault.state(), FaultState::Done(PfOutcome::Retry));
    }
}

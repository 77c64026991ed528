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

bitflags! {
    /// Properties shared by every shadow page of one table hierarchy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct RoleFlags: u16 {
        /// Maps guest physical memory directly (TDP), rather than shadowing a
        /// guest page table.
        const DIRECT = 1 << 0;
        /// Built for a nested (L2) guest.
        const GUEST_MODE = 1 << 1;
        /// Belongs to the system-management address space.
        const SMM = 1 << 2;
        /// Accessed/dirty bits are tracked in software.
        const AD_DISABLED = 1 << 3;
    }
}

bitflags! {
    /// Access rights granted by the entries of a shadow page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct RoleAccess: u8 {
        const EXEC = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl RoleAccess {
    pub const ALL: Self = Self::all();
}

/// Role of a shadow page. Together with the gfn it keys the page in the
/// shadow page hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRole {
    pub level: u8,
    pub flags: RoleFlags,
    pub access: RoleAccess,
}

impl PageRole {
    /// Role of a direct-mapped root at `level`.
    pub fn direct_root(level: u8, as_id: usize) -> Self {
        let mut flags = RoleFlags::DIRECT;
        if as_id == 1 {
            flags |= RoleFlags::SMM;
        }
        Self {
            level,
            flags,
            access: RoleAccess::ALL,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.flags.contains(RoleFlags::DIRECT)
    }

    /// Address space the page belongs to.
    pub fn as_id(&self) -> usize {
        if self.flags.contains(RoleFlags::SMM) { 1 } else { 0 }
    }

    /// Role of a table installed below a page of this role.
    pub fn child_role(&self) -> Self {
        Self {
            level: self.level - 1,
            ..*self
        }
    }
}

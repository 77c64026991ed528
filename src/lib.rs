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

#![no_std]
//! Two-dimensional paging for hypervisors.
//!
//! [`Mmu`] resolves nested page faults of a VM by building a shadow of its
//! guest-physical address space out of host frames: it picks the largest
//! page size the memslots and the huge page policy allow, keeps a reverse
//! map from guest frames to the entries mapping them, and lets vCPUs fault
//! concurrently under a single table lock with a lockless fast path.
//! [`VcpuMmu`] is the per-vCPU side of it.
//!
//! [`HypMm`] manages the hypervisor's own stage-1 address space.

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

mod config;
mod fault;
mod frame;
mod hal;
mod hugepage;
mod hyp;
mod level;
mod mmu;
mod rmap;
mod role;
mod slot;
mod spte;
mod store;
mod vcpu;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

use memory_addr::{def_usize_addr, def_usize_addr_formatter};

def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

pub use config::MmuConfig;
pub use fault::{ErrorCode, FaultState, PageFault, PfOutcome};
pub use frame::{PageCache, PhysFrame};
pub use hal::MmuHal;
pub use hugepage::{HugePageAdvisor, NxHugePages, SlotMeta};
pub use hyp::{
    HYP_PAGE_SIZE, HypMm, HypPageTable, HypPgd, PAGE_HYP, PAGE_HYP_DEVICE, PAGE_HYP_EXEC,
    PAGE_HYP_RO, PageSize, get_order,
};
pub use level::{
    Gfn, PG_LEVEL_1G, PG_LEVEL_2M, PG_LEVEL_4K, PG_LEVEL_256T, PG_LEVEL_512G, Pfn,
};
pub use mmu::{Mmu, MmuRoot, MmuStats};
pub use rmap::{ReverseMapIndex, RmapKey, SptepRef};
pub use role::{PageRole, RoleAccess, RoleFlags};
pub use slot::{MemSlot, MemSlotDesc, MemSlots, SlotFlags, SlotId};
pub use spte::{SptPage, Spte};
pub use store::{PageTableStore, ShadowPage, SpHandle};
pub use vcpu::{VcpuMmu, VcpuMmuStats};

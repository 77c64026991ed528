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

use memory_addr::{PhysAddr, VirtAddr};

use crate::level::Gfn;

/// Services the MMU needs from the host.
pub trait MmuHal {
    /// Allocates one 4K physical frame. The frame is expected to be zeroed.
    fn alloc_frame(&self) -> Option<PhysAddr>;
    /// Returns a frame obtained from [`MmuHal::alloc_frame`].
    fn dealloc_frame(&self, paddr: PhysAddr);
    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr;
    /// Converts a host virtual address to a host physical address.
    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr;

    /// Invalidates cached translations on every CPU running the guest.
    fn flush_remote_tlbs(&self);

    /// Invalidates cached translations for `pages` frames starting at
    /// `start_gfn`.
    fn flush_remote_tlbs_with_address(&self, start_gfn: Gfn, pages: u64) {
        let _ = (start_gfn, pages);
        self.flush_remote_tlbs();
    }
}

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

//! Used to query and populate the hypervisor's own stage-1 page table.
use alloc::vec::Vec;
use core::marker::PhantomData;

use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::{PhysAddr, VirtAddr, align_offset, is_aligned};
use page_table_entry::{GenericPTE, MappingFlags};

use crate::frame::PhysFrame;
use crate::hal::MmuHal;
use crate::level::ENTRY_COUNT;

const fn p4_index(vaddr: usize) -> usize {
    (vaddr >> (12 + 27)) & (ENTRY_COUNT - 1)
}

const fn p3_index(vaddr: usize) -> usize {
    (vaddr >> (12 + 18)) & (ENTRY_COUNT - 1)
}

const fn p2_index(vaddr: usize) -> usize {
    (vaddr >> (12 + 9)) & (ENTRY_COUNT - 1)
}

const fn p1_index(vaddr: usize) -> usize {
    (vaddr >> 12) & (ENTRY_COUNT - 1)
}

/// Size of one mapping in the hypervisor table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K = 0x1000,
    Size2M = 0x20_0000,
    Size1G = 0x4000_0000,
}

impl PageSize {
    pub const fn is_huge(self) -> bool {
        !matches!(self, Self::Size4K)
    }

    /// Largest size that `vaddr` and `paddr` are both aligned to and that
    /// fits in `remaining` bytes.
    fn largest_for(vaddr: usize, paddr: usize, remaining: usize) -> Self {
        [Self::Size1G, Self::Size2M]
            .into_iter()
            .find(|&size| {
                let size = size as usize;
                is_aligned(vaddr, size) && is_aligned(paddr, size) && remaining >= size
            })
            .unwrap_or(Self::Size4K)
    }
}

/// Where a walk towards a mapping of some size ended.
enum Walk<'a, PTE> {
    /// The entry for a mapping of the requested size.
    Entry(&'a mut PTE),
    /// A larger block mapping already covers the address.
    Block(PTE, PageSize),
}

/// A 4-level table mapping hypervisor virtual addresses.
///
/// It owns every table frame, which are freed by [`HypPageTable::free_all`].
pub struct HypPageTable<PTE: GenericPTE> {
    root_paddr: PhysAddr,
    frames: Vec<PhysFrame>,
    _phantom: PhantomData<PTE>,
}

impl<PTE: GenericPTE> HypPageTable<PTE> {
    pub fn try_new<H: MmuHal>(hal: &H) -> AxResult<Self> {
        let root = PhysFrame::alloc_zero(hal)?;
        Ok(Self {
            root_paddr: root.start_paddr(),
            frames: alloc::vec![root],
            _phantom: PhantomData,
        })
    }

    /// Get the root page table physical address.
    pub fn root_paddr(&self) -> PhysAddr {
        self.root_paddr
    }

    /// Number of table frames, the root included.
    pub fn table_count(&self) -> usize {
        self.frames.len()
    }

    /// Maps `size` bytes at `vaddr` to `paddr`, with the largest blocks the
    /// alignment allows.
    ///
    /// Re-creating an identical mapping is not an error. A conflicting one is
    /// reported and the existing mapping is kept.
    pub fn map_region<H: MmuHal>(
        &mut self,
        hal: &H,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: MappingFlags,
    ) -> AxResult {
        let (mut vaddr, mut paddr) = (vaddr.as_usize(), paddr.as_usize());
        if !is_aligned(vaddr, PageSize::Size4K as usize)
            || !is_aligned(paddr, PageSize::Size4K as usize)
            || !is_aligned(size, PageSize::Size4K as usize)
        {
            return ax_err!(InvalidInput, "hyp mapping is not page aligned");
        }

        let end = vaddr
            .checked_add(size)
            .ok_or_else(|| ax_err_type!(InvalidInput, "hyp mapping wraps around"))?;
        while vaddr < end {
            let page_size = PageSize::largest_for(vaddr, paddr, end - vaddr);
            self.map_one(hal, vaddr, paddr, page_size, flags)?;
            vaddr += page_size as usize;
            paddr += page_size as usize;
        }
        Ok(())
    }

    /// Queries the mapping of `vaddr`.
    ///
    /// Returns the physical address `vaddr` maps to, the mapping flags, and
    /// the page size.
    pub fn query<H: MmuHal>(
        &self,
        hal: &H,
        vaddr: VirtAddr,
    ) -> AxResult<(PhysAddr, MappingFlags, PageSize)> {
        let (entry, size) = self.get_entry(hal, vaddr.as_usize())?;
        if !entry.is_present() {
            return ax_err!(NotFound, "hyp address not mapped");
        }
        let off = align_offset(vaddr.as_usize(), size as usize);
        Ok((entry.paddr() + off, entry.flags(), size))
    }

    /// Returns every table frame to the host.
    pub fn free_all<H: MmuHal>(&mut self, hal: &H) {
        for frame in self.frames.drain(..) {
            frame.dealloc(hal);
        }
    }
}

// private implements
impl<PTE: GenericPTE> HypPageTable<PTE> {
    fn table_of<'a, H: MmuHal>(hal: &H, paddr: PhysAddr) -> &'a mut [PTE] {
        let ptr = hal.phys_to_virt(paddr).as_mut_ptr() as *mut PTE;
        // Table frames are owned by `self.frames` and only touched under the
        // hypervisor page table lock.
        unsafe { core::slice::from_raw_parts_mut(ptr, ENTRY_COUNT) }
    }

    fn next_table<'a, H: MmuHal>(hal: &H, entry: &PTE) -> AxResult<&'a mut [PTE]> {
        if !entry.is_present() {
            ax_err!(NotFound, "hyp address not mapped")
        } else {
            Ok(Self::table_of(hal, entry.paddr()))
        }
    }

    fn next_table_or_create<'a, H: MmuHal>(
        &mut self,
        hal: &H,
        entry: &mut PTE,
    ) -> AxResult<&'a mut [PTE]> {
        if entry.is_unused() {
            let frame = PhysFrame::alloc_zero(hal)?;
            *entry = PTE::new_table(frame.start_paddr());
            self.frames.push(frame);
        }
        Ok(Self::table_of(hal, entry.paddr()))
    }

    fn get_entry<H: MmuHal>(&self, hal: &H, vaddr: usize) -> AxResult<(&PTE, PageSize)> {
        let p4 = Self::table_of(hal, self.root_paddr);
        let p4e = &p4[p4_index(vaddr)];

        let p3 = Self::next_table(hal, p4e)?;
        let p3e = &p3[p3_index(vaddr)];
        if p3e.is_huge() {
            return Ok((p3e, PageSize::Size1G));
        }

        let p2 = Self::next_table(hal, p3e)?;
        let p2e = &p2[p2_index(vaddr)];
        if p2e.is_huge() {
            return Ok((p2e, PageSize::Size2M));
        }

        let p1 = Self::next_table(hal, p2e)?;
        let p1e = &p1[p1_index(vaddr)];
        Ok((p1e, PageSize::Size4K))
    }

    fn walk_create<'a, H: MmuHal>(
        &mut self,
        hal: &H,
        vaddr: usize,
        size: PageSize,
    ) -> AxResult<Walk<'a, PTE>> {
        let p4 = Self::table_of(hal, self.root_paddr);
        let p4e = &mut p4[p4_index(vaddr)];

        let p3 = self.next_table_or_create(hal, p4e)?;
        let p3e = &mut p3[p3_index(vaddr)];
        if size == PageSize::Size1G {
            return Ok(Walk::Entry(p3e));
        }
        if p3e.is_huge() {
            return Ok(Walk::Block(*p3e, PageSize::Size1G));
        }

        let p2 = self.next_table_or_create(hal, p3e)?;
        let p2e = &mut p2[p2_index(vaddr)];
        if size == PageSize::Size2M {
            return Ok(Walk::Entry(p2e));
        }
        if p2e.is_huge() {
            return Ok(Walk::Block(*p2e, PageSize::Size2M));
        }

        let p1 = self.next_table_or_create(hal, p2e)?;
        Ok(Walk::Entry(&mut p1[p1_index(vaddr)]))
    }

    fn map_one<H: MmuHal>(
        &mut self,
        hal: &H,
        vaddr: usize,
        paddr: usize,
        size: PageSize,
        flags: MappingFlags,
    ) -> AxResult {
        let new = PTE::new_page(PhysAddr::from(paddr), flags, size.is_huge());
        match self.walk_create(hal, vaddr, size)? {
            Walk::Entry(entry) => {
                if entry.is_unused() {
                    *entry = new;
                } else if entry.bits() != new.bits() {
                    warn!(
                        "hyp: {:#x} already mapped by {:?}, not remapping to {:#x}",
                        vaddr, entry, paddr
                    );
                }
            }
            Walk::Block(block, block_size) => {
                let covered = block.paddr().as_usize() + align_offset(vaddr, block_size as usize);
                if covered != paddr || block.flags() != flags {
                    warn!(
                        "hyp: {:#x} inside block {:?}, not remapping to {:#x}",
                        vaddr, block, paddr
                    );
                }
            }
        }
        Ok(())
    }
}

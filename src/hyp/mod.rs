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

//! The hypervisor's own address space.
//!
//! Besides the idmap of its text, the hypervisor maps two areas in the
//! quarter of the VA space that does not conflict with the idmap: private
//! mappings, growing up from `io_map_base`, and right above them the
//! vmemmap, an array with one [`HYP_PAGE_SIZE`]-byte descriptor per
//! physical page.

mod pgtable;

use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::{
    PAGE_SIZE_4K as PAGE_SIZE, PhysAddr, VirtAddr, align_down_4k, align_up, align_up_4k,
};
use page_table_entry::MappingFlags;
use spin::{Mutex, MutexGuard};

pub use self::pgtable::{HypPageTable, PageSize};
use crate::hal::MmuHal;
use crate::level::PAGE_SHIFT;
use crate::spte::Spte;

/// Size of the per-page descriptor stored in the vmemmap.
pub const HYP_PAGE_SIZE: usize = 4;

pub const PAGE_HYP: MappingFlags = MappingFlags::READ.union(MappingFlags::WRITE);
pub const PAGE_HYP_EXEC: MappingFlags = MappingFlags::READ.union(MappingFlags::EXECUTE);
pub const PAGE_HYP_RO: MappingFlags = MappingFlags::READ;
pub const PAGE_HYP_DEVICE: MappingFlags = PAGE_HYP.union(MappingFlags::DEVICE);

/// Smallest `order` such that `PAGE_SIZE << order` covers `size`.
pub const fn get_order(size: usize) -> u32 {
    if size <= PAGE_SIZE {
        0
    } else {
        usize::BITS - ((size - 1) >> PAGE_SHIFT).leading_zeros()
    }
}

/// State guarded by the hypervisor page table lock.
pub struct HypPgd {
    pgtable: HypPageTable<Spte>,
    io_map_base: usize,
    vmemmap_base: usize,
}

impl HypPgd {
    /// Start of the next private VA range; zero until the idmap is created.
    pub fn io_map_base(&self) -> usize {
        self.io_map_base
    }

    pub fn vmemmap_base(&self) -> usize {
        self.vmemmap_base
    }

    pub fn pgtable(&self) -> &HypPageTable<Spte> {
        &self.pgtable
    }

    /// Range of the vmemmap holding the descriptors of `size` bytes of
    /// physical memory at `phys`, in whole pages.
    pub fn vmemmap_range(&self, phys: PhysAddr, size: usize) -> (usize, usize) {
        let start = self.vmemmap_base + (phys.as_usize() >> PAGE_SHIFT) * HYP_PAGE_SIZE;
        let end = start + (size >> PAGE_SHIFT) * HYP_PAGE_SIZE;
        (align_down_4k(start), align_up_4k(end))
    }
}

pub struct HypMm<H: MmuHal> {
    hal: H,
    pgd_lock: Mutex<HypPgd>,
}

impl<H: MmuHal> HypMm<H> {
    pub fn new(hal: H) -> AxResult<Self> {
        let pgtable = HypPageTable::try_new(&hal)?;
        Ok(Self {
            hal,
            pgd_lock: Mutex::new(HypPgd {
                pgtable,
                io_map_base: 0,
                vmemmap_base: 0,
            }),
        })
    }

    pub fn root_paddr(&self) -> PhysAddr {
        self.pgd_lock.lock().pgtable.root_paddr()
    }

    /// Takes the page table lock, for the `_locked` operations.
    pub fn lock(&self) -> MutexGuard<'_, HypPgd> {
        self.pgd_lock.lock()
    }

    /// Maps `size` bytes at `start` to `phys`.
    pub fn create_mappings_at(
        &self,
        start: VirtAddr,
        size: usize,
        phys: PhysAddr,
        prot: MappingFlags,
    ) -> AxResult {
        let mut pgd = self.pgd_lock.lock();
        pgd.pgtable.map_region(&self.hal, start, phys, size, prot)
    }

    /// Maps the pages covering `[from, to)` to the memory backing them.
    pub fn create_mappings(&self, from: VirtAddr, to: VirtAddr, prot: MappingFlags) -> AxResult {
        let mut pgd = self.pgd_lock.lock();
        self.create_mappings_locked(&mut pgd, from, to, prot)
    }

    pub fn create_mappings_locked(
        &self,
        pgd: &mut HypPgd,
        from: VirtAddr,
        to: VirtAddr,
        prot: MappingFlags,
    ) -> AxResult {
        let start = align_down_4k(from.as_usize());
        let end = align_up_4k(to.as_usize());
        for vaddr in (start..end).step_by(PAGE_SIZE) {
            let vaddr = VirtAddr::from(vaddr);
            let phys = self.hal.virt_to_phys(vaddr);
            pgd.pgtable.map_region(&self.hal, vaddr, phys, PAGE_SIZE, prot)?;
        }
        Ok(())
    }

    /// Reserves `size` bytes of private VA, aligned to the order of `size`.
    pub fn alloc_private_va_range(&self, size: usize) -> AxResult<VirtAddr> {
        let mut pgd = self.pgd_lock.lock();
        let addr = align_up(pgd.io_map_base, PAGE_SIZE << get_order(size));
        let base = addr
            .checked_add(align_up_4k(size))
            .ok_or_else(|| ax_err_type!(NoMemory, "private VA range overflow"))?;
        if addr == 0 || base > pgd.vmemmap_base {
            return ax_err!(NoMemory, "private VA range would overlap the vmemmap");
        }
        pgd.io_map_base = base;
        Ok(VirtAddr::from(addr))
    }

    /// Maps `size` bytes of `phys` at a fresh private address. The returned
    /// address keeps the page offset of `phys`.
    pub fn create_private_mapping(
        &self,
        phys: PhysAddr,
        size: usize,
        prot: MappingFlags,
    ) -> AxResult<VirtAddr> {
        let offset = phys.as_usize() & (PAGE_SIZE - 1);
        let size = align_up_4k(size + offset);
        let addr = self.alloc_private_va_range(size)?;
        self.create_mappings_at(
            addr,
            size,
            PhysAddr::from(align_down_4k(phys.as_usize())),
            prot,
        )?;
        Ok(addr + offset)
    }

    /// Backs the vmemmap entries of `[phys, phys + size)` with memory at
    /// `back`.
    pub fn back_vmemmap(&self, phys: PhysAddr, size: usize, back: PhysAddr) -> AxResult {
        let mut pgd = self.pgd_lock.lock();
        let (start, end) = pgd.vmemmap_range(phys, size);
        pgd.pgtable
            .map_region(&self.hal, VirtAddr::from(start), back, end - start, PAGE_HYP)
    }

    /// Identity-maps the idmap text and places the private VA and vmemmap
    /// areas in the quarter of the VA space the idmap does not touch.
    pub fn create_idmap(&self, va_bits: u32, text_start: VirtAddr, text_end: VirtAddr) -> AxResult {
        if !(PAGE_SHIFT as u32 + 3..usize::BITS).contains(&va_bits) {
            return ax_err!(InvalidInput, "unsupported hyp VA size");
        }
        let start = align_down_4k(self.hal.virt_to_phys(text_start).as_usize());
        let end = align_up_4k(self.hal.virt_to_phys(text_end).as_usize());

        let mut pgd = self.pgd_lock.lock();
        // IOs use the lower half of the quarter, the vmemmap the upper half.
        pgd.io_map_base = (start & (1 << (va_bits - 2))) ^ (1 << (va_bits - 2));
        pgd.vmemmap_base = pgd.io_map_base | (1 << (va_bits - 3));
        debug!(
            "hyp idmap [{:#x}, {:#x}), io map base {:#x}, vmemmap {:#x}",
            start, end, pgd.io_map_base, pgd.vmemmap_base
        );

        pgd.pgtable.map_region(
            &self.hal,
            VirtAddr::from(start),
            PhysAddr::from(start),
            end - start,
            PAGE_HYP_EXEC,
        )
    }

    /// Physical address and permissions `vaddr` is mapped with.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<(PhysAddr, MappingFlags)> {
        let pgd = self.pgd_lock.lock();
        pgd.pgtable
            .query(&self.hal, vaddr)
            .ok()
            .map(|(paddr, flags, _)| (paddr, flags))
    }
}

impl<H: MmuHal> Drop for HypMm<H> {
    fn drop(&mut self) {
        self.pgd_lock.get_mut().pgtable.free_all(&self.hal);
    }
}

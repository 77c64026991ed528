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

//! Shadow page-table entries.
//!
//! Layout of a shadow-present entry:
//!
//! | bits   | meaning                                  |
//! |--------|------------------------------------------|
//! | 0      | present (readable)                       |
//! | 1      | writable                                 |
//! | 2      | user                                     |
//! | 5      | accessed                                 |
//! | 6      | dirty                                    |
//! | 7      | huge (leaf above 4K)                     |
//! | 12..52 | host physical address                    |
//! | 57     | host-writable (software)                 |
//! | 58     | mmu-writable (software)                  |
//! | 63     | no-execute                               |
//!
//! An MMIO entry has bit 0 clear and bit 62 set; bits 12..52 hold the gfn and
//! bits 52..62 the memslot generation it was created under.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;
use memory_addr::PhysAddr;
use page_table_entry::{GenericPTE, MappingFlags};

use crate::level::{ENTRY_COUNT, Gfn, PAGE_SHIFT, PG_LEVEL_4K, Pfn};

const PRESENT: usize = 0;
const WRITABLE: usize = 1;
const USER: usize = 2;
const ACCESSED: usize = 5;
const DIRTY: usize = 6;
const HUGE: usize = 7;
const HOST_WRITABLE: usize = 57;
const MMU_WRITABLE: usize = 58;
const MMIO_MARKER: usize = 62;
const NO_EXECUTE: usize = 63;

const ADDR_BITS: core::ops::Range<usize> = 12..52;
const MMIO_GEN_BITS: core::ops::Range<usize> = 52..62;

/// Mask applied to a memslot generation before it is stored in an MMIO entry.
pub const MMIO_GEN_MASK: u64 = (1 << 10) - 1;

/// A shadow page-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Spte(u64);

impl Spte {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Builds a leaf entry mapping `pfn` at `level`.
    pub fn new_leaf(pfn: Pfn, level: u8, flags: MappingFlags, host_writable: bool) -> Self {
        let paddr = PhysAddr::from((pfn as usize) << PAGE_SHIFT);
        let mut spte = Self::new_page(paddr, flags, level > PG_LEVEL_4K);
        spte.0.set_bit(HOST_WRITABLE, host_writable);
        // Anything the host lets us write may later be made writable without
        // taking the table lock.
        spte.0
            .set_bit(MMU_WRITABLE, host_writable && flags.contains(MappingFlags::WRITE));
        spte
    }

    /// Builds an MMIO entry for `gfn`, tagged with a memslot generation.
    pub fn new_mmio(gfn: Gfn, generation: u64) -> Self {
        let mut bits = 0u64;
        bits.set_bit(MMIO_MARKER, true);
        bits.set_bits(ADDR_BITS, gfn);
        bits.set_bits(MMIO_GEN_BITS, generation & MMIO_GEN_MASK);
        Self(bits)
    }

    pub fn is_shadow_present(self) -> bool {
        self.0.get_bit(PRESENT)
    }

    pub fn is_mmio(self) -> bool {
        !self.0.get_bit(PRESENT) && self.0.get_bit(MMIO_MARKER)
    }

    pub fn mmio_gfn(self) -> Gfn {
        self.0.get_bits(ADDR_BITS)
    }

    pub fn mmio_generation(self) -> u64 {
        self.0.get_bits(MMIO_GEN_BITS)
    }

    pub fn is_large(self) -> bool {
        self.0.get_bit(HUGE)
    }

    /// Whether this entry terminates the walk when found at `level`.
    pub fn is_last(self, level: u8) -> bool {
        level == PG_LEVEL_4K || self.is_large()
    }

    pub fn is_writable(self) -> bool {
        self.0.get_bit(WRITABLE)
    }

    pub fn is_mmu_writable(self) -> bool {
        self.0.get_bit(MMU_WRITABLE)
    }

    pub fn is_host_writable(self) -> bool {
        self.0.get_bit(HOST_WRITABLE)
    }

    pub fn is_accessed(self) -> bool {
        self.0.get_bit(ACCESSED)
    }

    pub fn is_dirty(self) -> bool {
        self.0.get_bit(DIRTY)
    }

    pub fn is_executable(self) -> bool {
        !self.0.get_bit(NO_EXECUTE)
    }

    pub fn pfn(self) -> Pfn {
        self.0.get_bits(ADDR_BITS)
    }

    /// A write-protected entry the lockless path may flip back to writable.
    pub fn can_be_made_writable(self) -> bool {
        self.is_shadow_present() && !self.is_writable() && self.is_mmu_writable()
    }

    /// Whether the access described by `write` / `exec` is already permitted.
    pub fn is_access_allowed(self, write: bool, exec: bool) -> bool {
        if !self.is_shadow_present() {
            return false;
        }
        if write && !self.is_writable() {
            return false;
        }
        if exec && !self.is_executable() {
            return false;
        }
        true
    }

    pub fn with_writable(self) -> Self {
        let mut bits = self.0;
        bits.set_bit(WRITABLE, true);
        bits.set_bit(DIRTY, true);
        Self(bits)
    }

    pub fn without_accessed(self) -> Self {
        let mut bits = self.0;
        bits.set_bit(ACCESSED, false);
        Self(bits)
    }

    /// Write permission bits removed by write protection. `pt_protect` also
    /// revokes the right to restore them locklessly.
    pub fn write_protect_mask(pt_protect: bool) -> u64 {
        let mut mask = 1u64 << WRITABLE;
        if pt_protect {
            mask |= 1 << MMU_WRITABLE;
        }
        mask
    }

    /// Whether every permission and the target of `self` is covered by `other`.
    /// Accessed and dirty state are ignored.
    pub fn is_subsumed_by(self, other: Spte) -> bool {
        let volatile = (1u64 << ACCESSED) | (1 << DIRTY);
        let grants = (1u64 << WRITABLE) | (1 << USER) | (1 << MMU_WRITABLE) | (1 << HOST_WRITABLE);
        let a = self.0 & !volatile;
        let b = other.0 & !volatile;
        if (a & !grants & !(1 << NO_EXECUTE)) != (b & !grants & !(1 << NO_EXECUTE)) {
            return false;
        }
        if a & grants & !b != 0 {
            return false;
        }
        // Executable `self` needs an executable `other`.
        self.is_executable() <= other.is_executable()
    }
}

impl GenericPTE for Spte {
    fn new_page(paddr: PhysAddr, flags: MappingFlags, is_huge: bool) -> Self {
        let mut spte = Self(0);
        spte.set_paddr(paddr);
        spte.set_flags(flags, is_huge);
        spte.0.set_bit(ACCESSED, true);
        spte
    }

    fn new_table(paddr: PhysAddr) -> Self {
        let mut bits = 0u64;
        bits.set_bit(PRESENT, true);
        bits.set_bit(WRITABLE, true);
        bits.set_bit(USER, true);
        bits.set_bit(ACCESSED, true);
        let mut spte = Self(bits);
        spte.set_paddr(paddr);
        spte
    }

    fn paddr(&self) -> PhysAddr {
        PhysAddr::from((self.0.get_bits(ADDR_BITS) as usize) << PAGE_SHIFT)
    }

    fn flags(&self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.0.get_bit(PRESENT) {
            flags |= MappingFlags::READ;
        }
        if self.0.get_bit(WRITABLE) {
            flags |= MappingFlags::WRITE;
        }
        if self.0.get_bit(USER) {
            flags |= MappingFlags::USER;
        }
        if !self.0.get_bit(NO_EXECUTE) {
            flags |= MappingFlags::EXECUTE;
        }
        flags
    }

    fn set_paddr(&mut self, paddr: PhysAddr) {
        self.0
            .set_bits(ADDR_BITS, (paddr.as_usize() >> PAGE_SHIFT) as u64);
    }

    fn set_flags(&mut self, flags: MappingFlags, is_huge: bool) {
        self.0.set_bit(PRESENT, flags.contains(MappingFlags::READ));
        self.0.set_bit(WRITABLE, flags.contains(MappingFlags::WRITE));
        self.0.set_bit(USER, flags.contains(MappingFlags::USER));
        self.0
            .set_bit(NO_EXECUTE, !flags.contains(MappingFlags::EXECUTE));
        self.0.set_bit(HUGE, is_huge);
    }

    fn bits(self) -> usize {
        self.0 as usize
    }

    fn is_unused(&self) -> bool {
        self.0 == 0
    }

    fn is_present(&self) -> bool {
        self.is_shadow_present()
    }

    fn is_huge(&self) -> bool {
        self.is_large()
    }

    fn clear(&mut self) {
        self.0 = 0
    }
}

impl fmt::Debug for Spte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_mmio() {
            return f
                .debug_struct("Spte::Mmio")
                .field("gfn", &format_args!("{:#x}", self.mmio_gfn()))
                .field("gen", &self.mmio_generation())
                .finish();
        }
        let mut f = f.debug_struct("Spte");
        f.field("raw", &format_args!("{:#x}", self.0));
        if self.is_shadow_present() {
            f.field("pfn", &format_args!("{:#x}", self.pfn()))
                .field("flags", &self.flags())
                .field("huge", &self.is_large());
        }
        f.finish()
    }
}

/// The 512 entries of one shadow page, as laid out in its backing frame.
///
/// Entries are only ever accessed atomically: installs use release stores so
/// that lockless walkers, which load with acquire, observe fully built child
/// tables.
#[repr(C, align(4096))]
pub struct SptPage {
    entries: [AtomicU64; ENTRY_COUNT],
}

impl SptPage {
    pub fn load(&self, index: usize) -> Spte {
        Spte(self.entries[index].load(Ordering::Acquire))
    }

    pub fn install(&self, index: usize, spte: Spte) {
        self.entries[index].store(spte.0, Ordering::Release);
    }

    /// Replaces an entry, returning the previous value including any bits set
    /// concurrently by the lockless path.
    pub fn exchange(&self, index: usize, spte: Spte) -> Spte {
        Spte(self.entries[index].swap(spte.0, Ordering::AcqRel))
    }

    pub fn compare_exchange(&self, index: usize, old: Spte, new: Spte) -> Result<Spte, Spte> {
        self.entries[index]
            .compare_exchange(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Spte)
            .map_err(Spte)
    }

    /// Clears `mask` from an entry and returns its previous value.
    pub fn clear_bits(&self, index: usize, mask: u64) -> Spte {
        Spte(self.entries[index].fetch_and(!mask, Ordering::AcqRel))
    }

    pub fn present_count(&self) -> usize {
        (0..ENTRY_COUNT)
            .filter(|&i| self.load(i).is_shadow_present())
            .count()
    }
}

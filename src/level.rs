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

//! Page-table levels and guest frame number arithmetic.
//!
//! Levels are numbered from the leaf upwards: level 1 maps 4 KiB pages,
//! level 2 maps 2 MiB pages and level 3 maps 1 GiB pages.

use memory_addr::PAGE_SIZE_4K;

/// Guest frame number.
pub type Gfn = u64;
/// Host frame number.
pub type Pfn = u64;

pub const PAGE_SHIFT: usize = 12;

pub const PG_LEVEL_4K: u8 = 1;
pub const PG_LEVEL_2M: u8 = 2;
pub const PG_LEVEL_1G: u8 = 3;
pub const PG_LEVEL_512G: u8 = 4;
pub const PG_LEVEL_256T: u8 = 5;

/// The largest level a leaf entry may be installed at.
pub const MAX_HUGEPAGE_LEVEL: u8 = PG_LEVEL_1G;
/// Number of huge-page levels that carry per-slot metadata (2M and 1G).
pub const NR_LPAGE_LEVELS: usize = (MAX_HUGEPAGE_LEVEL - PG_LEVEL_4K) as usize;

/// Frame numbers at or above this do not fit the address field of an entry.
pub const GFN_LIMIT: Gfn = 1 << (52 - PAGE_SHIFT);

pub const ENTRY_COUNT: usize = 512;
const LEVEL_BITS: u32 = 9;

/// Shift of a gfn at `level` relative to a 4K gfn.
pub const fn hpage_gfn_shift(level: u8) -> u32 {
    (level as u32 - 1) * LEVEL_BITS
}

/// Number of 4K pages covered by one entry at `level`.
pub const fn pages_per_hpage(level: u8) -> u64 {
    1 << hpage_gfn_shift(level)
}

/// Bytes covered by one entry at `level`.
pub const fn level_size(level: u8) -> usize {
    PAGE_SIZE_4K << hpage_gfn_shift(level)
}

/// Index of the entry translating `gfn` in a table at `level`.
pub const fn level_index(gfn: Gfn, level: u8) -> usize {
    ((gfn >> hpage_gfn_shift(level)) as usize) & (ENTRY_COUNT - 1)
}

/// First gfn of the `level`-sized region containing `gfn`.
pub const fn hpage_base(gfn: Gfn, level: u8) -> Gfn {
    gfn & !(pages_per_hpage(level) - 1)
}

/// Index of the `level`-sized region containing `gfn`, counted from the
/// region containing `base_gfn`.
pub const fn gfn_to_index(gfn: Gfn, base_gfn: Gfn, level: u8) -> usize {
    ((gfn >> hpage_gfn_shift(level)) - (base_gfn >> hpage_gfn_shift(level))) as usize
}

pub const fn gpa_to_gfn(gpa: usize) -> Gfn {
    (gpa >> PAGE_SHIFT) as Gfn
}

pub const fn gfn_to_gpa(gfn: Gfn) -> usize {
    (gfn as usize) << PAGE_SHIFT
}

/// Human readable size of a level, for logs.
pub fn level_name(level: u8) -> &'static str {
    match level {
        PG_LEVEL_4K => "4K",
        PG_LEVEL_2M => "2M",
        PG_LEVEL_1G => "1G",
        PG_LEVEL_512G => "512G",
        PG_LEVEL_256T => "256T",
        _ => "?",
    }
}

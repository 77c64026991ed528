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

use axerrno::{AxResult, ax_err};

use crate::hugepage::NxHugePages;
use crate::level::{MAX_HUGEPAGE_LEVEL, PG_LEVEL_4K, PG_LEVEL_256T, PG_LEVEL_512G};

/// Tunables of one [`Mmu`](crate::Mmu).
#[derive(Debug, Clone, Copy)]
pub struct MmuConfig {
    /// Number of levels of the nested page table (4 or 5).
    pub root_level: u8,
    /// Largest page size a fault may map.
    pub max_huge_level: u8,
    pub nx_huge_pages: NxHugePages,
    /// Whether the host CPU suffers from the instruction-TLB multihit erratum.
    pub itlb_multihit: bool,
    /// A recovery pass zaps `1 / nx_recovery_ratio` of the split huge pages.
    /// Zero disables recovery.
    pub nx_recovery_ratio: u32,
    /// Attempts at taking the table lock before a fault gives up with RETRY.
    pub max_lock_retries: u32,
    /// Compare-exchange attempts of the lockless fault path.
    pub max_fast_retries: u32,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            root_level: PG_LEVEL_512G,
            max_huge_level: MAX_HUGEPAGE_LEVEL,
            nx_huge_pages: NxHugePages::Auto,
            itlb_multihit: false,
            nx_recovery_ratio: 60,
            max_lock_retries: 1 << 12,
            max_fast_retries: 4,
        }
    }
}

impl MmuConfig {
    pub fn validate(&self) -> AxResult {
        if !(PG_LEVEL_512G..=PG_LEVEL_256T).contains(&self.root_level) {
            return ax_err!(InvalidInput, "root level must be 4 or 5");
        }
        if !(PG_LEVEL_4K..=MAX_HUGEPAGE_LEVEL).contains(&self.max_huge_level) {
            return ax_err!(InvalidInput, "max huge page level out of range");
        }
        if self.max_lock_retries == 0 || self.max_fast_retries == 0 {
            return ax_err!(InvalidInput, "retry bounds must be non-zero");
        }
        Ok(())
    }

    /// Whether executable huge pages start out forbidden.
    pub fn nx_huge_pages_enabled(&self) -> bool {
        self.nx_huge_pages.resolve(self.itlb_multihit)
    }

    /// Frames a single fault may need: one table per level below the root.
    pub fn walk_cache_min(&self) -> usize {
        self.root_level as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MmuConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.nx_huge_pages_enabled());
        assert_eq!(config.walk_cache_min(), 4);
    }

    #[test]
    fn test_invalid_config() {
        let config = MmuConfig {
            root_level: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MmuConfig {
            max_lock_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nx_auto_follows_host() {
        let config = MmuConfig {
            itlb_multihit: true,
            ..Default::default()
        };
        assert!(config.nx_huge_pages_enabled());
    }
}

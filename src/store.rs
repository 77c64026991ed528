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

//! Arena of shadow pages.
//!
//! Every shadow page lives in one slot of the arena and is referred to by an
//! [`SpHandle`]. Valid pages are additionally indexed by `(as_id, gfn, role)`
//! and by the host physical address of their table, which is what a parent
//! entry stores.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{AxResult, ax_err};
use memory_addr::PhysAddr;
use page_table_entry::GenericPTE;

use crate::frame::{PageCache, PhysFrame};
use crate::hal::MmuHal;
use crate::level::{Gfn, hpage_gfn_shift};
use crate::rmap::SptepRef;
use crate::role::PageRole;
use crate::spte::{SptPage, Spte};

/// Writes to a shadowed gfn after which its shadow page is dropped.
const WRITE_FLOOD_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpHandle(pub(crate) u32);

type HashKey = (usize, Gfn, PageRole);

/// One level of the shadow page table.
///
/// Pages are only ever built for direct (TDP) roles, which are never
/// unsync, so no unsynced-children count is kept.
#[derive(Debug)]
pub struct ShadowPage {
    role: PageRole,
    gfn: Gfn,
    frame: PhysFrame,
    spt: NonNull<SptPage>,
    mmu_valid_gen: u64,
    /// Zapped while still in use as a root.
    invalid: bool,
    /// Number of vCPUs using this page as their root.
    pub(crate) root_count: u32,
    /// Entries pointing at this page.
    pub(crate) parent_ptes: Vec<SptepRef>,
    /// Created because a huge mapping was forbidden for an executable page.
    pub(crate) lpage_disallowed: bool,
    write_flooding_count: AtomicU32,
}

// The table behind `spt` is owned by `frame` and only ever accessed atomically.
unsafe impl Send for ShadowPage {}
unsafe impl Sync for ShadowPage {}

impl ShadowPage {
    pub fn role(&self) -> PageRole {
        self.role
    }

    pub fn level(&self) -> u8 {
        self.role.level
    }

    pub fn gfn(&self) -> Gfn {
        self.gfn
    }

    /// Host physical address of the table.
    pub fn hpa(&self) -> PhysAddr {
        self.frame.start_paddr()
    }

    pub fn spt(&self) -> &SptPage {
        unsafe { self.spt.as_ref() }
    }

    /// First gfn translated by entry `index`.
    pub fn gfn_at(&self, index: usize) -> Gfn {
        self.gfn + ((index as u64) << hpage_gfn_shift(self.role.level))
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn is_obsolete(&self, valid_gen: u64) -> bool {
        self.invalid || self.mmu_valid_gen != valid_gen
    }

    pub fn root_count(&self) -> u32 {
        self.root_count
    }

    pub fn is_lpage_disallowed(&self) -> bool {
        self.lpage_disallowed
    }

    pub fn write_flooding_count(&self) -> u32 {
        self.write_flooding_count.load(Ordering::Relaxed)
    }

    /// Counts a write to the shadowed gfn; true once the page should go.
    pub fn detect_write_flooding(&self) -> bool {
        self.write_flooding_count.fetch_add(1, Ordering::Relaxed) + 1 >= WRITE_FLOOD_THRESHOLD
    }

    /// The page is in active use by the walker.
    pub fn clear_write_flooding(&self) {
        self.write_flooding_count.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct PageTableStore {
    pages: Vec<Option<ShadowPage>>,
    free_handles: Vec<u32>,
    hash: BTreeMap<HashKey, Vec<SpHandle>>,
    by_hpa: BTreeMap<usize, SpHandle>,
    valid_gen: u64,
    /// Frames of evicted pages not yet returned to the host.
    pending_free: Vec<PhysFrame>,
    nr_pages: usize,
}

impl PageTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nr_pages
    }

    pub fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }

    pub fn valid_gen(&self) -> u64 {
        self.valid_gen
    }

    /// Makes every existing page obsolete.
    pub fn bump_valid_gen(&mut self) -> u64 {
        self.valid_gen += 1;
        self.valid_gen
    }

    pub fn page(&self, sp: SpHandle) -> &ShadowPage {
        self.pages[sp.0 as usize]
            .as_ref()
            .expect("stale shadow page handle")
    }

    pub(crate) fn page_mut(&mut self, sp: SpHandle) -> &mut ShadowPage {
        self.pages[sp.0 as usize]
            .as_mut()
            .expect("stale shadow page handle")
    }

    pub fn contains(&self, sp: SpHandle) -> bool {
        self.pages
            .get(sp.0 as usize)
            .is_some_and(|p| p.is_some())
    }

    pub fn handles(&self) -> Vec<SpHandle> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| SpHandle(i as u32))
            .collect()
    }

    /// The page whose table lives at `hpa`.
    pub fn page_by_hpa(&self, hpa: PhysAddr) -> Option<SpHandle> {
        self.by_hpa.get(&hpa.as_usize()).copied()
    }

    /// A valid page keyed by `(as_id, gfn, role)`.
    pub fn find(&self, as_id: usize, gfn: Gfn, role: PageRole) -> Option<SpHandle> {
        self.hash.get(&(as_id, gfn, role))?.iter().copied().find(|&sp| {
            !self.page(sp).is_obsolete(self.valid_gen)
        })
    }

    /// All pages, valid or not, keyed at `gfn`.
    pub fn pages_with_gfn(&self, gfn: Gfn) -> Vec<SpHandle> {
        self.hash
            .iter()
            .filter(|((_, g, _), _)| *g == gfn)
            .flat_map(|(_, list)| list.iter().copied())
            .collect()
    }

    pub fn lookup_root(&self, role: PageRole) -> Option<SpHandle> {
        self.find(role.as_id(), 0, role)
    }

    /// Inserts a page backed by `frame`.
    pub fn create<H: MmuHal>(
        &mut self,
        hal: &H,
        role: PageRole,
        gfn: Gfn,
        frame: PhysFrame,
    ) -> SpHandle {
        frame.fill(hal, 0);
        let spt = hal.phys_to_virt(frame.start_paddr()).as_mut_ptr() as *mut SptPage;
        let hpa = frame.start_paddr();
        let page = ShadowPage {
            role,
            gfn,
            frame,
            spt: NonNull::new(spt).expect("frame mapped at null"),
            mmu_valid_gen: self.valid_gen,
            invalid: false,
            root_count: 0,
            parent_ptes: Vec::new(),
            lpage_disallowed: false,
            write_flooding_count: AtomicU32::new(0),
        };

        let sp = match self.free_handles.pop() {
            Some(index) => {
                self.pages[index as usize] = Some(page);
                SpHandle(index)
            }
            None => {
                self.pages.push(Some(page));
                SpHandle(self.pages.len() as u32 - 1)
            }
        };
        self.hash.entry((role.as_id(), gfn, role)).or_default().push(sp);
        self.by_hpa.insert(hpa.as_usize(), sp);
        self.nr_pages += 1;
        debug!(
            "created shadow page {:?} level {} gfn {:#x} hpa {:#x}",
            sp, role.level, gfn, hpa
        );
        sp
    }

    /// Finds or creates the page to be installed in entry `index` of
    /// `parent`, and links it there. Returns whether a page was created.
    pub fn get_or_create_child<H: MmuHal>(
        &mut self,
        hal: &H,
        cache: &mut PageCache,
        parent: SpHandle,
        index: usize,
    ) -> AxResult<(SpHandle, bool)> {
        let (role, gfn) = {
            let p = self.page(parent);
            (p.role().child_role(), p.gfn_at(index))
        };

        let existing = self
            .find(role.as_id(), gfn, role)
            .filter(|&sp| self.page(sp).parent_ptes.is_empty());
        let (child, created) = match existing {
            Some(sp) => (sp, false),
            None => {
                let frame = cache.alloc()?;
                (self.create(hal, role, gfn, frame), true)
            }
        };
        self.link(parent, index, child);
        Ok((child, created))
    }

    /// Points entry `index` of `parent` at `child`.
    pub fn link(&mut self, parent: SpHandle, index: usize, child: SpHandle) {
        let hpa = self.page(child).hpa();
        let sptep = SptepRef::new(parent, index);
        self.page_mut(child).parent_ptes.push(sptep);
        // Publish only once the child is fully set up.
        self.page(parent).spt().install(index, Spte::new_table(hpa));
    }

    /// Clears entry `sptep` and forgets it as a parent of `child`.
    pub fn unlink(&mut self, sptep: SptepRef, child: SpHandle) {
        self.page(sptep.sp)
            .spt()
            .exchange(sptep.index as usize, Spte::EMPTY);
        let parents = &mut self.page_mut(child).parent_ptes;
        if let Some(pos) = parents.iter().position(|p| *p == sptep) {
            parents.swap_remove(pos);
        } else {
            warn!("{:?} is not a parent of {:?}", sptep, child);
        }
    }

    pub(crate) fn mark_invalid(&mut self, sp: SpHandle) {
        self.page_mut(sp).invalid = true;
    }

    /// Removes a page that nothing references any more. Its frame is kept
    /// until [`PageTableStore::take_pending_free`].
    pub fn evict(&mut self, sp: SpHandle) -> AxResult {
        let page = self.page(sp);
        if page.root_count != 0 || !page.parent_ptes.is_empty() {
            return ax_err!(BadState, "evicting a referenced shadow page");
        }
        let Some(page) = self.pages[sp.0 as usize].take() else {
            return ax_err!(NotFound);
        };

        let key = (page.role.as_id(), page.gfn, page.role);
        if let Some(list) = self.hash.get_mut(&key) {
            list.retain(|&h| h != sp);
            if list.is_empty() {
                self.hash.remove(&key);
            }
        }
        self.by_hpa.remove(&page.hpa().as_usize());
        self.free_handles.push(sp.0);
        self.nr_pages -= 1;
        debug!(
            "evicted shadow page {:?} level {} gfn {:#x}",
            sp, page.role.level, page.gfn
        );
        self.pending_free.push(page.frame);
        Ok(())
    }

    pub fn has_pending_free(&self) -> bool {
        !self.pending_free.is_empty()
    }

    pub fn take_pending_free(&mut self) -> Vec<PhysFrame> {
        core::mem::take(&mut self.pending_free)
    }

    /// Empties the arena and returns every frame it held, referenced or not.
    pub(crate) fn drain_frames(&mut self) -> Vec<PhysFrame> {
        let mut frames = core::mem::take(&mut self.pending_free);
        frames.extend(self.pages.drain(..).flatten().map(|page| page.frame));
        self.free_handles.clear();
        self.hash.clear();
        self.by_hpa.clear();
        self.nr_pages = 0;
        frames
    }
}

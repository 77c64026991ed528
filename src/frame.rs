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

use alloc::vec::Vec;

use axerrno::{AxResult, ax_err_type};
use memory_addr::{PAGE_SIZE_4K as PAGE_SIZE, PhysAddr};

use crate::hal::MmuHal;

/// A 4K-sized physical frame owned by the MMU.
///
/// Unlike a heap allocation the frame does not know its allocator, so it has
/// to be handed back with [`PhysFrame::dealloc`].
#[derive(Debug)]
pub struct PhysFrame {
    start_paddr: PhysAddr,
}

impl PhysFrame {
    pub fn alloc<H: MmuHal>(hal: &H) -> AxResult<Self> {
        let start_paddr = hal
            .alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self { start_paddr })
    }

    pub fn alloc_zero<H: MmuHal>(hal: &H) -> AxResult<Self> {
        let f = Self::alloc(hal)?;
        f.fill(hal, 0);
        Ok(f)
    }

    pub fn start_paddr(&self) -> PhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr<H: MmuHal>(&self, hal: &H) -> *mut u8 {
        hal.phys_to_virt(self.start_paddr).as_mut_ptr()
    }

    pub fn fill<H: MmuHal>(&self, hal: &H, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(hal), byte, PAGE_SIZE) }
    }

    pub fn dealloc<H: MmuHal>(self, hal: &H) {
        hal.dealloc_frame(self.start_paddr);
        trace!("deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

/// Zeroed frames set aside before the table lock is taken, so that a fault
/// never has to call into the host allocator while holding it.
#[derive(Debug, Default)]
pub struct PageCache {
    frames: Vec<PhysFrame>,
}

impl PageCache {
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Fills the cache up to `min` frames.
    pub fn topup<H: MmuHal>(&mut self, hal: &H, min: usize) -> AxResult {
        while self.frames.len() < min {
            self.frames.push(PhysFrame::alloc_zero(hal)?);
        }
        Ok(())
    }

    pub fn alloc(&mut self) -> AxResult<PhysFrame> {
        self.frames
            .pop()
            .ok_or_else(|| ax_err_type!(NoMemory, "page cache exhausted"))
    }

    /// Returns a frame that was taken but not used.
    pub fn give_back(&mut self, frame: PhysFrame) {
        self.frames.push(frame);
    }

    pub fn free_all<H: MmuHal>(&mut self, hal: &H) {
        for frame in self.frames.drain(..) {
            frame.dealloc(hal);
        }
    }
}

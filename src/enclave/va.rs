// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
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

//! Version-array page management (spec §3 "Version-array page").
//!
//! Slots are always allocated from the tail page. This version of the
//! core never frees a slot (the reload path is intentionally minimal,
//! spec §9 O1), so `note_slot_freed` below is never called today. A
//! reload implementer picking this back up should note it moves pages by
//! index, which shifts every `VaSlotId` pointing past the removed
//! position — any outstanding slot ids would need remapping to match,
//! not just the freed one.

use alloc::vec::Vec;

use crate::consts::VA_SLOT_COUNT;
use crate::page::SecurePageId;

/// Identifies one sealing slot within an enclave's version-array pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VaSlotId {
    pub va_page: usize,
    pub slot: u16,
}

struct VaPage {
    page: SecurePageId,
    next_free: u16,
}

/// The ordered list of version-array pages belonging to one enclave.
#[derive(Default)]
pub struct VaPageList {
    pages: Vec<VaPage>,
}

impl VaPageList {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn secure_pages(&self) -> impl Iterator<Item = SecurePageId> + '_ {
        self.pages.iter().map(|p| p.page)
    }

    /// Allocates a sealing slot, appending a new version-array page if
    /// the current tail is full. The caller supplies a way to allocate
    /// the secure page to back a new VA page, since allocation goes
    /// through the pool allocator and can fail (spec §4.E phase 4).
    pub fn allocate_slot<E>(
        &mut self,
        alloc_new_page: impl FnOnce() -> Result<SecurePageId, E>,
    ) -> Result<VaSlotId, E> {
        if let Some(tail) = self.pages.last_mut() {
            if (tail.next_free as usize) < VA_SLOT_COUNT {
                let slot = tail.next_free;
                tail.next_free += 1;
                return Ok(VaSlotId {
                    va_page: self.pages.len() - 1,
                    slot,
                });
            }
            // Tail is full. A page that regains room after a future
            // reload is moved here, to the new tail, by `note_slot_freed`.
        }
        let page = alloc_new_page()?;
        self.pages.push(VaPage {
            page,
            next_free: 1,
        });
        Ok(VaSlotId {
            va_page: self.pages.len() - 1,
            slot: 0,
        })
    }

    /// The secure page backing a previously allocated slot.
    pub fn page_of(&self, id: VaSlotId) -> SecurePageId {
        self.pages[id.va_page].page
    }

    /// Records that a slot was released by a reload, possibly moving its
    /// page to the tail of the list so future allocations prefer it
    /// (spec §3 "a full page is moved to the end of the list").
    pub fn note_slot_freed(&mut self, id: VaSlotId) {
        if id.va_page + 1 == self.pages.len() {
            return; // already the tail
        }
        let page = self.pages.remove(id.va_page);
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

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

//! The section pool (spec §4.A).
//!
//! Sections are discovered once at driver load and never resized
//! afterwards. Each section owns its own free list and mutex, so
//! allocation contention and NUMA locality stay section-local; the
//! pool-wide free count is read lock-free off each section's atomic
//! counter (spec §3 "authoritative availability signal").

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::page::{PageState, SecurePage, SecurePageId};

/// One firmware-described range of secure pages.
pub struct Section {
    index: u8,
    phys_base: u64,
    virt_base: usize,
    pages: Vec<Mutex<SecurePage>>,
    free_list: Mutex<Vec<u32>>,
    free_count: AtomicUsize,
}

impl Section {
    fn new(index: u8, phys_base: u64, virt_base: usize, page_count: u32) -> Self {
        let pages = (0..page_count)
            .map(|i| {
                Mutex::new(SecurePage::free(SecurePageId {
                    section: index,
                    index: i,
                }))
            })
            .collect();
        let free_list = (0..page_count).rev().collect();
        Self {
            index,
            phys_base,
            virt_base,
            pages,
            free_list: Mutex::new(free_list),
            free_count: AtomicUsize::new(page_count as usize),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Physical base address of the secure page at `local_index`.
    pub fn phys_addr(&self, local_index: u32) -> u64 {
        self.phys_base + local_index as u64 * crate::consts::PAGE_SIZE as u64
    }

    /// Virtual base address of the secure page at `local_index`, for use
    /// by an embedder that needs to map it.
    pub fn virt_addr(&self, local_index: u32) -> usize {
        self.virt_base + local_index as usize * crate::consts::PAGE_SIZE
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn page(&self, local_index: u32) -> &Mutex<SecurePage> {
        &self.pages[local_index as usize]
    }

    /// Detaches a page from the free list and binds `owner` to it.
    /// Returns `None` if the section is currently empty.
    pub(crate) fn take_free(&self) -> Option<u32> {
        let mut list = self.free_list.lock();
        let idx = list.pop()?;
        self.free_count.fetch_sub(1, Ordering::AcqRel);
        Some(idx)
    }

    /// Returns a page to the free list. Caller must have already reset
    /// its `SecurePage::state` to `Free` and cleared flags.
    pub(crate) fn push_free(&self, local_index: u32) {
        self.free_list.lock().push(local_index);
        self.free_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// The ordered array of sections discovered at start-up (spec §4.A).
pub struct SectionPool {
    sections: Vec<Arc<Section>>,
    rr_cursor: AtomicUsize,
}

/// One firmware-reported range, as supplied to [`SectionPool::new`].
pub struct SectionRange {
    pub phys_base: u64,
    pub virt_base: usize,
    pub page_count: u32,
}

impl SectionPool {
    pub fn new(ranges: &[SectionRange]) -> Self {
        assert!(
            ranges.len() <= crate::consts::MAX_SECTIONS,
            "too many sections reported by firmware"
        );
        let sections = ranges
            .iter()
            .enumerate()
            .map(|(i, r)| Arc::new(Section::new(i as u8, r.phys_base, r.virt_base, r.page_count)))
            .collect();
        Self {
            sections,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn sections(&self) -> &[Arc<Section>] {
        &self.sections
    }

    pub fn section(&self, index: u8) -> &Arc<Section> {
        &self.sections[index as usize]
    }

    /// Total free pages across every section (spec §3 P1, read
    /// lock-free).
    pub fn free_count_total(&self) -> usize {
        self.sections.iter().map(|s| s.free_count()).sum()
    }

    /// Round-robins over sections looking for one with a free page,
    /// starting just after the last section that satisfied a request
    /// (spec §4.B).
    pub(crate) fn take_free_round_robin(&self) -> Option<SecurePageId> {
        let n = self.sections.len();
        if n == 0 {
            return None;
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let si = (start + i) % n;
            let section = &self.sections[si];
            if let Some(local) = section.take_free() {
                return Some(SecurePageId {
                    section: section.index(),
                    index: local,
                });
            }
        }
        None
    }

    pub(crate) fn free_page(&self, id: SecurePageId) {
        let section = &self.sections[id.section as usize];
        {
            let mut page = section.page(id.index).lock();
            page.flags = crate::page::PageFlags::empty();
            page.state = PageState::Free;
        }
        section.push_free(id.index);
    }
}

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

//! The secure page descriptor (spec §3).
//!
//! A secure page never moves: it is identified by `(section, index)` for
//! its whole lifetime. List membership (section free list, global
//! reclaimable list, bound to an enclave page) is tracked as an explicit
//! state enum rather than an intrusive pointer, which keeps the pool free
//! of unsafe code while preserving invariant I1 (a page is in exactly one
//! place at a time).

use alloc::sync::Weak;
use bitflags::bitflags;

use crate::enclave::EnclaveInner;
use crate::enclave::PageIndex;

bitflags! {
    /// Per-page flags (spec §3).
    pub struct PageFlags: u8 {
        /// The page is on the global reclaim list (or eligible to be).
        const RECLAIMABLE = 1 << 0;
        /// The page's owning enclave-page has been marked evicted.
        const RECLAIMED   = 1 << 1;
    }
}

/// Identifies one secure page within the pool for its entire lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecurePageId {
    pub section: u8,
    pub index: u32,
}

/// Which slot of an enclave a secure page is bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OwnerSlot {
    /// The enclave's SECS; never on the reclaim list (spec I3).
    Secs,
    /// A regular enclave page, indexed into the enclave's page map.
    Page(PageIndex),
    /// A version-array page (spec §3 "Version-array page"). Internal
    /// sealing storage, not user-visible, so never on the reclaim list —
    /// same rationale as `Secs` under I3.
    Va,
}

/// Non-owning back-pointer from a secure page to the enclave-page that
/// currently binds it (spec §3 "back-pointer to its current owner").
#[derive(Clone)]
pub struct PageOwner {
    pub enclave: Weak<EnclaveInner>,
    pub slot: OwnerSlot,
}

/// Where a secure page currently lives (spec §3 I1).
pub enum PageState {
    /// On its section's free list.
    Free,
    /// Bound to an enclave page and not reclaimable (e.g. the SECS page,
    /// spec I3).
    Bound(PageOwner),
    /// Bound to an enclave page and present on the global reclaim list.
    Reclaimable(PageOwner),
}

/// The mutable state of one secure page slot.
pub struct SecurePage {
    pub id: SecurePageId,
    pub flags: PageFlags,
    pub state: PageState,
}

impl SecurePage {
    pub fn free(id: SecurePageId) -> Self {
        Self {
            id,
            flags: PageFlags::empty(),
            state: PageState::Free,
        }
    }

    pub fn owner(&self) -> Option<&PageOwner> {
        match &self.state {
            PageState::Free => None,
            PageState::Bound(o) | PageState::Reclaimable(o) => Some(o),
        }
    }
}

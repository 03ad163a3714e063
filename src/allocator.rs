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

//! The page allocator (spec §4.B).

use alloc::sync::Weak;
use log::trace;

use crate::core::Core;
use crate::enclave::EnclaveInner;
use crate::error::{Error, Result};
use crate::page::{OwnerSlot, PageOwner, PageState, SecurePageId};
use crate::platform::wait_on;

/// Reserves one free secure page without binding it to an owner yet
/// (spec §4.B). Used directly by enclave construction, which needs a
/// page reserved before it has a `Weak<EnclaveInner>` to bind it to (see
/// `Arc::new_cyclic` in `enclave::create`).
pub fn reserve(core: &Core, may_reclaim: bool) -> Result<SecurePageId> {
    loop {
        if let Some(id) = core.sections().take_free_round_robin() {
            return Ok(id);
        }

        if !may_reclaim {
            return Err(Error::OutOfMemory);
        }

        core.wake_reclaimer.bump();
        wait_on(core.platform(), &core.progress)?;
    }
}

/// Binds a previously reserved page to `(enclave, slot)`, clearing any
/// stale flags (spec §4.B).
pub fn bind(core: &Core, id: SecurePageId, enclave: Weak<EnclaveInner>, slot: OwnerSlot) {
    let section = core.sections().section(id.section);
    let mut page = section.page(id.index).lock();
    page.state = PageState::Bound(PageOwner { enclave, slot });
}

/// Allocates one secure page and binds it to `(enclave, slot)`
/// (spec §4.B).
///
/// When every section is empty: if `may_reclaim` is `false`, fails with
/// `OutOfMemory` immediately; otherwise wakes the reclaimer and waits on
/// its progress notification, retrying the round-robin scan after each
/// wake-up. The wait is interruptible.
pub fn allocate(
    core: &Core,
    enclave: Weak<EnclaveInner>,
    slot: OwnerSlot,
    may_reclaim: bool,
) -> Result<SecurePageId> {
    let id = reserve(core, may_reclaim)?;
    bind(core, id, enclave, slot);
    trace!("allocate: bound {:?} to {:?}", id, slot);
    Ok(id)
}

/// Conditional free (spec §4.B `try_free`): detaches `id` from the global
/// reclaim list if it is still on it. Returns `true` if freed, `false` if
/// the reclaimer has already taken it for eviction (the caller should
/// leave `RECLAIMED` as the outstanding free request, see §4.B).
pub fn try_free(core: &Core, id: SecurePageId) -> bool {
    let section = core.sections().section(id.section);
    let is_reclaimable = matches!(
        section.page(id.index).lock().state,
        PageState::Reclaimable(_)
    );
    if !is_reclaimable {
        return false;
    }
    if core.reclaim_list.remove(id) {
        core.hw().remove(section.phys_addr(id.index));
        core.sections().free_page(id);
        true
    } else {
        false
    }
}

/// Unconditional free (spec §4.B `free`): issues the hardware remove
/// primitive and returns the page to its section's free list
/// regardless of current list membership.
pub fn free(core: &Core, id: SecurePageId) {
    let section = core.sections().section(id.section);
    core.reclaim_list.remove(id);
    core.hw().remove(section.phys_addr(id.index));
    core.sections().free_page(id);
}

/// Returns a page to its section after a successful reclaim write-back
/// (spec §4.E phase 4 "return the secure page to its section"). Unlike
/// [`free`], this does *not* issue the hardware remove primitive: a
/// successful write-back already releases the hardware's tracking of
/// the physical page, and issuing EREMOVE-equivalent again on top would
/// be the teardown operation for a *live* binding, not an evicted one.
pub(crate) fn reclaim_return(core: &Core, id: SecurePageId) {
    core.sections().free_page(id);
}

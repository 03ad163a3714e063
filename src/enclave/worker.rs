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

//! The add-page worker (spec §4.D).
//!
//! One worker is activated per enclave on the first `add_page` enqueue,
//! and drains the enclave's pending-request queue, serializing the slow
//! hardware add/extend primitives away from the ioctl caller's context
//! (spec §4.D "Rationale for async").

use alloc::boxed::Box;
use alloc::sync::Arc;

use bit_field::BitField;
use log::{trace, warn};

use crate::allocator;
use crate::consts::{MEASURE_CHUNKS, MEASURE_CHUNK_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::OwnerSlot;
use crate::reclaim;

use super::{EnclaveInner, PendingAddRequest};

/// Activates the worker for `enclave` if it is not already running
/// (spec §4.D "activated on first enqueue"). The caller must have just
/// enqueued the first request onto a previously-empty queue; this
/// function sets `worker_active` before spawning to close the race
/// against a second caller observing an empty queue concurrently.
pub(crate) fn spawn(enclave: Arc<EnclaveInner>) {
    {
        let mut st = enclave.state().lock();
        if st.worker_active {
            return;
        }
        st.worker_active = true;
    }

    let core = enclave.core().clone();
    core.platform()
        .spawn("sgx-add-worker", Box::new(move || run(enclave.clone())));
}

/// The worker body: drains `enclave`'s queue one request at a time,
/// yielding between iterations (spec §4.D, §9 O3).
fn run(enclave: Arc<EnclaveInner>) {
    let core = enclave.core().clone();
    loop {
        core.platform().yield_now();

        let req = {
            let mut st = enclave.state().lock();
            match st.pending.pop_front() {
                Some(r) => r,
                None => {
                    st.worker_active = false;
                    return;
                }
            }
        };

        if enclave.is_dead() {
            drain_and_stop(&enclave);
            return;
        }

        if let Err(e) = apply(&enclave, &req) {
            warn!(
                "add-page worker: add failed for page {:?}: {}; marking enclave dead",
                req.page_index, e
            );
            enclave.mark_dead();
            drain_and_stop(&enclave);
            return;
        }
    }
}

/// Discards every request still queued and releases the worker's active
/// flag (spec §4.D "the enclave is transitioned to DEAD, any
/// already-enqueued request is discarded").
fn drain_and_stop(enclave: &Arc<EnclaveInner>) {
    let mut st = enclave.state().lock();
    st.pending.clear();
    st.worker_active = false;
}

/// Performs one EADD-equivalent plus its selected EEXTEND-equivalents,
/// then binds the resulting secure page into the enclave's page map
/// (spec §4.D).
fn apply(enclave: &Arc<EnclaveInner>, req: &PendingAddRequest) -> Result<()> {
    let mut data = [0u8; PAGE_SIZE];
    enclave.backing().pin_read(req.page_index, &mut data)?;

    let core = enclave.core();
    let secure_id = allocator::allocate(
        core,
        Arc::downgrade(enclave),
        OwnerSlot::Page(req.page_index),
        true,
    )?;

    let secs_phys = enclave.secs_phys().ok_or(Error::Dead)?;
    let section = core.sections().section(secure_id.section);
    let page_phys = section.phys_addr(secure_id.index);
    let enclave_offset = req.page_index.0 * PAGE_SIZE as u64;

    let status = core.hw().add(secs_phys, page_phys, enclave_offset, &data);
    if !status.is_ok() {
        allocator::free(core, secure_id);
        return Err(Error::HardwareFault);
    }

    for chunk in 0..MEASURE_CHUNKS {
        if !req.measurement_mask.get_bit(chunk) {
            continue;
        }
        let chunk_offset = (chunk * MEASURE_CHUNK_SIZE) as u64;
        let status = core.hw().extend(secs_phys, page_phys, chunk_offset);
        if !status.is_ok() {
            allocator::free(core, secure_id);
            return Err(Error::HardwareFault);
        }
    }

    {
        let mut st = enclave.state().lock();
        let page = st
            .page_map
            .get_mut(&req.page_index)
            .expect("enclave page inserted at add_page enqueue time");
        page.secure_page = Some(secure_id);
        st.child_count += 1;
    }

    // Every non-SECS enclave page is reclaimable the instant it is bound
    // (spec I3); SECS and version-array pages never go through `apply`.
    reclaim::mark_reclaimable(core, secure_id);
    trace!(
        "add-page worker: bound page {:?} to {:?}",
        req.page_index, secure_id
    );
    Ok(())
}

/// Blocks the caller (spec §4.C `init` "Flushes the add-page worker")
/// until `enclave`'s pending queue is fully drained and no worker is
/// running. Used so `init` never races a still-in-flight EADD.
pub(crate) fn flush(enclave: &Arc<EnclaveInner>) {
    let core = enclave.core().clone();
    loop {
        let idle = {
            let st = enclave.state().lock();
            st.pending.is_empty() && !st.worker_active
        };
        if idle {
            return;
        }
        core.platform().yield_now();
    }
}

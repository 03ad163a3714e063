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

//! The shape of the character-device ioctl boundary (spec §6).
//!
//! This is deliberately thin: the real device-registration, `copy_from_user`,
//! and VMA bookkeeping live entirely in the embedder (spec §1 "deliberately
//! out of scope"). What belongs to the core is the four command payloads
//! and the translation of [`Error`] into the exit code the dispatcher
//! hands back to userspace.

use alloc::sync::Arc;

use crate::backing::BackingStoreFactory;
use crate::consts::PAGE_SIZE;
use crate::core::Core;
use crate::enclave::sinfo::{SecInfo, TcsLayout};
use crate::enclave::sigstruct::{SigStruct, Token};
use crate::enclave::secs::Secs;
use crate::enclave::{Enclave, EnclaveInner, PageIndex};
use crate::error::Error;
use crate::hw::MeasureMask;

/// `CREATE(src_ptr_to_secs)` (spec §6).
pub struct CreateRequest {
    pub secs: Secs,
}

/// `ADD_PAGE(addr, src, secinfo_ptr, mrmask)` (spec §6).
pub struct AddPageRequest {
    pub addr: u64,
    pub data: [u8; PAGE_SIZE],
    pub secinfo: SecInfo,
    pub tcs_layout: Option<TcsLayout>,
    pub measurement_mask: MeasureMask,
}

/// `INIT(addr, sigstruct_ptr)`; the token buffer is allocated by the
/// dispatcher alongside the sigstruct (spec §6).
pub struct InitRequest {
    pub sigstruct: SigStruct,
    pub token: Token,
}

/// `SET_ATTRIBUTE(addr, attribute_fd)`; the dispatcher has already
/// resolved `attribute_fd` to the designated provisioning-attribute
/// value before calling in (spec §6).
pub struct SetAttributeRequest {
    pub attribute: u64,
}

/// `CREATE` → [`EnclaveInner::create`] (spec §6).
pub fn create(
    core: Arc<Core>,
    req: CreateRequest,
    backing: &dyn BackingStoreFactory,
) -> core::result::Result<Enclave, i32> {
    EnclaveInner::create(core, req.secs, backing).map_err(|e| e.to_errno())
}

/// `ADD_PAGE` → [`EnclaveInner::add_page`] (spec §6). `addr` is resolved
/// to a page index relative to the enclave's base by the caller.
pub fn add_page(enclave: &Enclave, req: AddPageRequest) -> i32 {
    if req.addr < enclave.base || (req.addr - enclave.base) % PAGE_SIZE as u64 != 0 {
        return Error::InvalidArgument.to_errno();
    }
    let index = PageIndex((req.addr - enclave.base) / PAGE_SIZE as u64);
    match enclave.add_page(
        index,
        &req.data,
        req.secinfo,
        req.tcs_layout,
        req.measurement_mask,
    ) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// `INIT` → [`EnclaveInner::init`] (spec §6). On a faulted hardware
/// result the documented contract is to return the unmodified
/// non-negative hardware status rather than a negative errno; the core
/// only ever returns [`Error::HardwareFault`], so the dispatcher's own
/// call into the hardware layer is where that status would be threaded
/// through — out of scope here (spec §1).
pub fn init(enclave: &Enclave, req: InitRequest) -> i32 {
    match enclave.init(&req.sigstruct, &req.token) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// `SET_ATTRIBUTE` → [`EnclaveInner::set_allowed_attribute`] (spec §6).
pub fn set_attribute(enclave: &Enclave, req: SetAttributeRequest) -> i32 {
    enclave.set_allowed_attribute(req.attribute);
    0
}

/// Helper asserting the mapping shape constraint from spec §4.C
/// `create` ("the mapping must already exist, span exactly
/// `[base, base+size)`, and have zero page offset"). The address-space
/// layer itself is the OS collaborator (spec §6); this only checks the
/// shape of values the dispatcher would have already looked up.
pub fn validate_mapping(map_start: u64, map_len: u64, map_page_offset: u64, base: u64, size: u64) -> bool {
    map_start == base && map_len == size && map_page_offset == 0
}

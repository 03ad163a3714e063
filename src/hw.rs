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

//! The privileged hardware primitive layer (spec §6).
//!
//! Every primitive is modeled as an opaque operation over physical
//! addresses, returning a [`HwStatus`]. The core never inspects the
//! hardware registers itself; an embedder supplies a concrete
//! [`HardwareOps`] that issues the real instructions (or, in tests, a
//! scripted fake).

use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    /// Status returned by a hardware primitive (spec §6).
    pub enum HwStatus {
        /// The primitive completed successfully.
        Ok = 0,
        /// Transient condition (e.g. an unmasked event during EINIT);
        /// the caller should retry.
        TransientRetry = 1,
        /// write-back observed the target SECS is not currently tracked;
        /// the caller must track it and retry.
        NotTracked = 2,
        /// The primitive detected a faulted enclave state.
        Fault = 3,
        /// Any other unrecoverable failure.
        InternalError = 4,
    }
}

impl HwStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, HwStatus::Ok)
    }
}

/// A physical address of a secure page, as handed to a hardware primitive.
pub type PhysAddr = u64;

/// The measurement mask selecting which 256-byte chunks of an added page
/// contribute to the enclave measurement (spec §3, §4.D).
pub type MeasureMask = u16;

/// The nine privileged primitives the hardware exposes (spec §1, §6).
///
/// Each method takes physical addresses only — the core has already
/// resolved any enclave-page or secure-page descriptor to the relevant
/// physical location before calling in.
pub trait HardwareOps: Send + Sync {
    /// ECREATE-equivalent: turns a freshly allocated secure page into the
    /// SECS for a new enclave.
    fn create(&self, secs_pa: PhysAddr, secs_src: &[u8]) -> HwStatus;

    /// EADD-equivalent: binds `page_pa` into `secs_pa`'s enclave at
    /// `enclave_offset`, copying `data` (one page) into it.
    fn add(&self, secs_pa: PhysAddr, page_pa: PhysAddr, enclave_offset: u64, data: &[u8]) -> HwStatus;

    /// EEXTEND-equivalent: extends the running measurement with one
    /// 256-byte chunk of `page_pa` at `chunk_offset`.
    fn extend(&self, secs_pa: PhysAddr, page_pa: PhysAddr, chunk_offset: u64) -> HwStatus;

    /// EINIT-equivalent: finalizes the enclave's measurement against a
    /// signature structure, returning the raw non-negative hardware
    /// status on a faulted result as well as on success/transient.
    fn init(&self, secs_pa: PhysAddr, sigstruct: &[u8], token: &[u8]) -> HwStatus;

    /// EBLOCK-equivalent: marks `page_pa` as blocked, so that any
    /// subsequent TLB entry for it will fault.
    fn block(&self, page_pa: PhysAddr) -> HwStatus;

    /// ETRACK-equivalent: arms cross-processor tracking for `secs_pa` so
    /// write-back can detect any CPU still running inside the enclave.
    fn track(&self, secs_pa: PhysAddr) -> HwStatus;

    /// EWB-equivalent: seals `page_pa` into the version-array slot at
    /// `va_slot_pa`/`va_slot_index`, writing the encrypted contents and
    /// MAC into `out_sealed` (one page) and `out_mac`.
    fn write_back(
        &self,
        secs_pa: PhysAddr,
        page_pa: PhysAddr,
        va_slot_pa: PhysAddr,
        va_slot_index: u32,
        out_sealed: &mut [u8],
        out_mac: &mut [u8],
    ) -> HwStatus;

    /// ELDU/ELDB-equivalent: reloads a previously written-back page into
    /// `page_pa`, verifying it against the sealing metadata held at
    /// `va_slot_pa`/`va_slot_index`.
    fn reload(
        &self,
        secs_pa: PhysAddr,
        page_pa: PhysAddr,
        va_slot_pa: PhysAddr,
        va_slot_index: u32,
        sealed: &[u8],
        mac: &[u8],
    ) -> HwStatus;

    /// EREMOVE-equivalent: releases a secure page back to the
    /// non-enclave state.
    fn remove(&self, page_pa: PhysAddr) -> HwStatus;
}

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

//! Shared test fakes, used by `#[cfg(test)]` modules across the crate.
//! Only compiled for `cargo test --features std` (the hosted fakes in
//! [`crate::host`] are the only `Platform`/`BackingStoreFactory`/
//! `AddressSpaceOps` impls available outside a real kernel build).

#![cfg(all(test, feature = "std"))]

extern crate std;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use std::sync::Mutex;

use crate::core::Core;
use crate::enclave::secs::{Attributes, Secs};
use crate::enclave::{Enclave, EnclaveInner};
use crate::hw::{HardwareOps, HwStatus, PhysAddr};
use crate::host::{NoopShootdown, StdAddressSpace, StdBackingStoreFactory, StdPlatform};
use crate::section::SectionRange;

/// A tag recorded for each hardware op `FakeHw` sees, so a test can
/// assert on cross-op ordering (spec I7, P5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCall {
    Create,
    Add,
    Block,
    Track,
    WriteBack,
    Remove,
}

/// A scriptable `HardwareOps`: every primitive succeeds by default.
/// `fail_add`/`init_status`/`not_tracked_until` let individual tests
/// steer a specific primitive's result; `calls` is an append-only log of
/// every invocation in the order it happened, for ordering assertions.
pub struct FakeHw {
    pub calls: Mutex<Vec<HwCall>>,
    pub fail_add: bool,
    pub init_status: HwStatus,
    /// `write_back` returns `NotTracked` this many times before `Ok`.
    pub not_tracked_until: AtomicU32,
}

impl Default for FakeHw {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_add: false,
            init_status: HwStatus::Ok,
            not_tracked_until: AtomicU32::new(0),
        }
    }
}

impl HardwareOps for FakeHw {
    fn create(&self, _secs_pa: PhysAddr, _secs_src: &[u8]) -> HwStatus {
        self.calls.lock().unwrap().push(HwCall::Create);
        HwStatus::Ok
    }

    fn add(&self, _secs_pa: PhysAddr, _page_pa: PhysAddr, _enclave_offset: u64, _data: &[u8]) -> HwStatus {
        self.calls.lock().unwrap().push(HwCall::Add);
        if self.fail_add {
            HwStatus::Fault
        } else {
            HwStatus::Ok
        }
    }

    fn extend(&self, _secs_pa: PhysAddr, _page_pa: PhysAddr, _chunk_offset: u64) -> HwStatus {
        HwStatus::Ok
    }

    fn init(&self, _secs_pa: PhysAddr, _sigstruct: &[u8], _token: &[u8]) -> HwStatus {
        self.init_status
    }

    fn block(&self, _page_pa: PhysAddr) -> HwStatus {
        self.calls.lock().unwrap().push(HwCall::Block);
        HwStatus::Ok
    }

    fn track(&self, _secs_pa: PhysAddr) -> HwStatus {
        self.calls.lock().unwrap().push(HwCall::Track);
        HwStatus::Ok
    }

    fn write_back(
        &self,
        _secs_pa: PhysAddr,
        page_pa: PhysAddr,
        _va_slot_pa: PhysAddr,
        _va_slot_index: u32,
        out_sealed: &mut [u8],
        out_mac: &mut [u8],
    ) -> HwStatus {
        if self.not_tracked_until.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n == 0 {
                None
            } else {
                Some(n - 1)
            }
        }).is_ok()
        {
            return HwStatus::NotTracked;
        }
        self.calls.lock().unwrap().push(HwCall::WriteBack);
        out_sealed.fill((page_pa % 251) as u8);
        out_mac.fill(0xAB);
        HwStatus::Ok
    }

    fn reload(
        &self,
        _secs_pa: PhysAddr,
        _page_pa: PhysAddr,
        _va_slot_pa: PhysAddr,
        _va_slot_index: u32,
        _sealed: &[u8],
        _mac: &[u8],
    ) -> HwStatus {
        HwStatus::Ok
    }

    fn remove(&self, _page_pa: PhysAddr) -> HwStatus {
        self.calls.lock().unwrap().push(HwCall::Remove);
        HwStatus::Ok
    }
}

/// Builds a `Core` with one section of `page_count` secure pages, `hw` as
/// the hardware collaborator, and the hosted `std`-feature fakes for
/// everything else.
pub fn test_core(hw: FakeHw, page_count: u32) -> Arc<Core> {
    Core::new(
        &[SectionRange {
            phys_base: 0,
            virt_base: 0,
            page_count,
        }],
        Arc::new(hw),
        StdPlatform::new(),
        Arc::new(StdAddressSpace::new()),
        Arc::new(NoopShootdown::default()),
    )
}

/// Creates an enclave of `size_pages` pages at `base`, with default
/// attributes (64-bit mode only, no debug/provisioning).
pub fn make_enclave(core: &Arc<Core>, base: u64, size_pages: u64) -> Enclave {
    let secs = Secs {
        base,
        size: size_pages * crate::consts::PAGE_SIZE as u64,
        attributes: Attributes::MODE64BIT.bits(),
        xfrm: 0x3,
        misc_select: 0,
        ssa_frame_pages: 1,
    };
    EnclaveInner::create(core.clone(), secs, &StdBackingStoreFactory).expect("enclave create should succeed")
}

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

//! The init retry loop (spec §4.H).
//!
//! The hardware init primitive may bounce with a transient "unmasked
//! event" status; the retry policy absorbs that without the caller ever
//! seeing it, only sleeping (and thus becoming interruptible) once a
//! full spin round has been exhausted.

use crate::consts::{SLEEP_COUNT, SLEEP_TIME_MS, SPIN_COUNT};
use crate::core::Core;
use crate::error::{Error, Result};
use crate::hw::HwStatus;

/// Runs the bounded retry loop around the hardware init primitive
/// (spec §4.H). `secs_phys` is the already-resolved physical address of
/// the enclave's SECS.
///
/// An outer loop of up to [`SLEEP_COUNT`] iterations; each iteration
/// spins up to [`SPIN_COUNT`] times on the primitive before sleeping.
/// Transient statuses are absorbed entirely within a spin round, so a
/// signal can only abort the wait during the interruptible sleep
/// (spec B4: "returns Interrupted after at most one sleep").
pub fn run(core: &Core, secs_phys: u64, sigstruct: &[u8], token: &[u8]) -> Result<()> {
    for _ in 0..SLEEP_COUNT {
        for _ in 0..SPIN_COUNT {
            match core.hw().init(secs_phys, sigstruct, token) {
                HwStatus::Ok => return Ok(()),
                HwStatus::TransientRetry => continue,
                HwStatus::Fault => return Err(Error::HardwareFault),
                HwStatus::NotTracked | HwStatus::InternalError => return Err(Error::HardwareFault),
            }
        }
        core.platform().sleep_interruptible(SLEEP_TIME_MS)?;
    }
    // Every outer iteration ran its full spin round and still saw only
    // transient statuses: the firmware is not recovering. Treated as a
    // fatal hardware condition rather than looping forever (spec §4.H
    // does not name a terminal case for this; resolved in DESIGN.md).
    Err(Error::HardwareFault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::attach::{AddressSpaceOps, AttachmentId, Shootdown};
    use crate::hw::{HardwareOps, PhysAddr};
    use crate::platform::{Platform, WaitGate};
    use crate::section::SectionRange;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHw {
        calls: AtomicU32,
        transient_then_ok: u32,
    }

    impl HardwareOps for ScriptedHw {
        fn create(&self, _: PhysAddr, _: &[u8]) -> HwStatus {
            HwStatus::Ok
        }
        fn add(&self, _: PhysAddr, _: PhysAddr, _: u64, _: &[u8]) -> HwStatus {
            HwStatus::Ok
        }
        fn extend(&self, _: PhysAddr, _: PhysAddr, _: u64) -> HwStatus {
            HwStatus::Ok
        }
        fn init(&self, _: PhysAddr, _: &[u8], _: &[u8]) -> HwStatus {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.transient_then_ok {
                HwStatus::TransientRetry
            } else {
                HwStatus::Ok
            }
        }
        fn block(&self, _: PhysAddr) -> HwStatus {
            HwStatus::Ok
        }
        fn track(&self, _: PhysAddr) -> HwStatus {
            HwStatus::Ok
        }
        fn write_back(
            &self,
            _: PhysAddr,
            _: PhysAddr,
            _: PhysAddr,
            _: u32,
            _: &mut [u8],
            _: &mut [u8],
        ) -> HwStatus {
            HwStatus::Ok
        }
        fn reload(
            &self,
            _: PhysAddr,
            _: PhysAddr,
            _: PhysAddr,
            _: u32,
            _: &[u8],
            _: &[u8],
        ) -> HwStatus {
            HwStatus::Ok
        }
        fn remove(&self, _: PhysAddr) -> HwStatus {
            HwStatus::Ok
        }
    }

    struct NoopAddressSpace;
    impl AddressSpaceOps for NoopAddressSpace {
        fn zap(&self, _: AttachmentId, _: u64) {}
        fn test_and_clear_young(&self, _: AttachmentId, _: u64) -> bool {
            false
        }
        fn install_frame(&self, _: AttachmentId, _: u64, _: PhysAddr) {}
        fn cpu_set(&self, _: AttachmentId) -> Vec<u32> {
            Vec::new()
        }
    }

    struct NoopShootdown;
    impl Shootdown for NoopShootdown {
        fn shootdown(&self, _: &[u32]) {}
    }

    struct TestPlatform {
        sleeps: AtomicU32,
    }
    impl Platform for TestPlatform {
        fn spawn(&self, _: &'static str, _: Box<dyn FnMut() + Send>) {}
        fn yield_now(&self) {}
        fn wait(&self, _: &WaitGate, _: u64) -> Result<()> {
            Ok(())
        }
        fn sleep_interruptible(&self, _: u64) -> Result<()> {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn signal_pending(&self) -> bool {
            false
        }
    }

    fn test_core(hw: ScriptedHw) -> Arc<Core> {
        Core::new(
            &[SectionRange {
                phys_base: 0,
                virt_base: 0,
                page_count: 4,
            }],
            Arc::new(hw),
            Arc::new(TestPlatform {
                sleeps: AtomicU32::new(0),
            }),
            Arc::new(NoopAddressSpace),
            Arc::new(NoopShootdown),
        )
    }

    #[test]
    fn s5_transient_then_ok_within_spin_budget_no_sleep() {
        let hw = ScriptedHw {
            calls: AtomicU32::new(0),
            transient_then_ok: 3,
        };
        let core = test_core(hw);
        let result = run(&core, 0x1000, &[0u8; 8], &[0u8; 8]);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn persistent_transient_exhausts_into_hardware_fault() {
        let hw = ScriptedHw {
            calls: AtomicU32::new(0),
            transient_then_ok: u32::MAX,
        };
        let core = test_core(hw);
        let result = run(&core, 0x1000, &[0u8; 8], &[0u8; 8]);
        assert_eq!(result, Err(Error::HardwareFault));
    }

    struct InterruptingPlatform;
    impl Platform for InterruptingPlatform {
        fn spawn(&self, _: &'static str, _: Box<dyn FnMut() + Send>) {}
        fn yield_now(&self) {}
        fn wait(&self, _: &WaitGate, _: u64) -> Result<()> {
            Ok(())
        }
        fn sleep_interruptible(&self, _: u64) -> Result<()> {
            Err(Error::Interrupted)
        }
        fn signal_pending(&self) -> bool {
            false
        }
    }

    #[test]
    fn b4_signal_during_sleep_returns_interrupted_after_one_sleep() {
        let hw = ScriptedHw {
            calls: AtomicU32::new(0),
            transient_then_ok: u32::MAX,
        };
        let core = Core::new(
            &[SectionRange {
                phys_base: 0,
                virt_base: 0,
                page_count: 4,
            }],
            Arc::new(hw),
            Arc::new(InterruptingPlatform),
            Arc::new(NoopAddressSpace),
            Arc::new(NoopShootdown),
        );
        let result = run(&core, 0x1000, &[0u8; 8], &[0u8; 8]);
        assert_eq!(result, Err(Error::Interrupted));
    }
}

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

//! A std-backed implementation of every collaborator trait (spec §6),
//! gated behind the `std` feature. Used by the integration tests and
//! available to any hosted (non-kernel) embedder that wants to run this
//! core outside a driver build — e.g. for fuzzing or a userspace
//! reference implementation, the way `enarx-sgx` keeps its own `std`
//! feature around `iocuddle`/`libc` for exactly the same reason.

extern crate std;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tempfile::tempfile;

use crate::backing::{BackingStore, BackingStoreFactory};
use crate::consts::{MAC_SIZE, PAGE_SIZE};
use crate::enclave::attach::{AddressSpaceOps, AttachmentId, Shootdown};
use crate::enclave::PageIndex;
use crate::error::{Error, Result};
use crate::hw::PhysAddr;
use crate::platform::{Platform, WaitGate};

/// A backing file stored in an OS temp file, mirroring the real driver's
/// anonymous page-cache-backed file (spec §6 "Backing-file layer").
/// Reads and writes go through `pread`/`pwrite`-equivalent positioned
/// I/O so no in-process locking beyond a single mutex is required.
pub struct StdBackingStore {
    file: Mutex<std::fs::File>,
    data_bytes: u64,
}

impl StdBackingStore {
    fn data_offset(&self, index: PageIndex) -> u64 {
        index.0 * PAGE_SIZE as u64
    }

    fn metadata_offset(&self, index: PageIndex) -> u64 {
        self.data_bytes + index.0 * MAC_SIZE as u64
    }

    fn io_err<T>(_: std::io::Error) -> Result<T> {
        Err(Error::HardwareFault)
    }
}

impl BackingStore for StdBackingStore {
    fn pin_read(&self, index: PageIndex, out: &mut [u8; PAGE_SIZE]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        if file.seek(SeekFrom::Start(self.data_offset(index))).is_err() {
            return Self::io_err(std::io::Error::last_os_error());
        }
        if file.read_exact(out).is_err() {
            // A page never written is logically zero-filled, matching an
            // anonymous mapping's initial content.
            out.fill(0);
        }
        Ok(())
    }

    fn write(&self, index: PageIndex, data: &[u8; PAGE_SIZE]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.lock().unwrap();
        if file.seek(SeekFrom::Start(self.data_offset(index))).is_err() {
            return Self::io_err(std::io::Error::last_os_error());
        }
        file.write_all(data).or_else(Self::io_err)
    }

    fn write_metadata(&self, index: PageIndex, meta: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.lock().unwrap();
        if file.seek(SeekFrom::Start(self.metadata_offset(index))).is_err() {
            return Self::io_err(std::io::Error::last_os_error());
        }
        file.write_all(meta).or_else(Self::io_err)
    }

    fn read_metadata(&self, index: PageIndex, meta: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        if file.seek(SeekFrom::Start(self.metadata_offset(index))).is_err() {
            return Self::io_err(std::io::Error::last_os_error());
        }
        file.read_exact(meta).or_else(Self::io_err)
    }
}

/// Creates [`StdBackingStore`]s sized `size_pages * PAGE_SIZE` data bytes
/// plus `size_pages * MAC_SIZE` metadata bytes (spec §3 "size + size/32
/// pages" read as page-granular slack, not byte-granular — see
/// DESIGN.md: the spec's §6 "N/32 bytes" wording cannot hold one
/// `MAC_SIZE`-byte sealing record per page, so the metadata region is
/// sized to actually fit one record per page instead).
pub struct StdBackingStoreFactory;

impl BackingStoreFactory for StdBackingStoreFactory {
    fn create(&self, size_pages: u64) -> Result<Box<dyn BackingStore>> {
        let file = tempfile().map_err(|_| Error::HardwareFault)?;
        let data_bytes = size_pages * PAGE_SIZE as u64;
        let total = data_bytes + size_pages * MAC_SIZE as u64;
        file.set_len(total).map_err(|_| Error::HardwareFault)?;
        Ok(Box::new(StdBackingStore {
            file: Mutex::new(file),
            data_bytes,
        }))
    }
}

/// A simulated address-space collaborator (spec §6): tracks, per
/// attached id, which virtual addresses have an "installed" frame and a
/// "young" bit, entirely in memory. Good enough to drive the fault
/// handler and reclaim-pipeline tests without a real MMU.
#[derive(Default)]
pub struct StdAddressSpace {
    young: Mutex<BTreeMap<(AttachmentId, u64), bool>>,
    installed: Mutex<BTreeMap<(AttachmentId, u64), PhysAddr>>,
    cpus: Mutex<BTreeMap<AttachmentId, Vec<u32>>>,
}

impl StdAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only: marks `vaddr` as having been accessed in `id`'s space.
    pub fn touch(&self, id: AttachmentId, vaddr: u64) {
        self.young.lock().unwrap().insert((id, vaddr), true);
    }

    /// Test-only: records that `id`'s address space has executed on `cpu`.
    pub fn record_cpu(&self, id: AttachmentId, cpu: u32) {
        self.cpus.lock().unwrap().entry(id).or_default().push(cpu);
    }

    pub fn installed_frame(&self, id: AttachmentId, vaddr: u64) -> Option<PhysAddr> {
        self.installed.lock().unwrap().get(&(id, vaddr)).copied()
    }
}

impl AddressSpaceOps for StdAddressSpace {
    fn zap(&self, id: AttachmentId, vaddr: u64) {
        self.installed.lock().unwrap().remove(&(id, vaddr));
    }

    fn test_and_clear_young(&self, id: AttachmentId, vaddr: u64) -> bool {
        let mut young = self.young.lock().unwrap();
        match young.get_mut(&(id, vaddr)) {
            Some(flag) if *flag => {
                *flag = false;
                true
            }
            _ => false,
        }
    }

    fn install_frame(&self, id: AttachmentId, vaddr: u64, phys: PhysAddr) {
        self.installed.lock().unwrap().insert((id, vaddr), phys);
    }

    fn cpu_set(&self, id: AttachmentId) -> Vec<u32> {
        self.cpus.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }
}

/// A no-op shootdown: in a hosted test there are no real in-enclave
/// threads to force out (spec §9 O2 accepts any synchronous mechanism).
#[derive(Default)]
pub struct NoopShootdown;

impl Shootdown for NoopShootdown {
    fn shootdown(&self, _cpus: &[u32]) {}
}

/// A real-thread `Platform` using `std::thread`, a condvar-backed
/// `WaitGate` wait, and a process-wide "signal" flag the test harness
/// can raise to exercise the interruptible paths (spec B4, R-propagation
/// of `Interrupted`).
pub struct StdPlatform {
    lock: Mutex<()>,
    cvar: Condvar,
    signalled: core::sync::atomic::AtomicBool,
}

impl StdPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            signalled: core::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Test-only: makes the next/any blocking wait observe a pending
    /// signal.
    pub fn raise_signal(&self) {
        self.signalled
            .store(true, core::sync::atomic::Ordering::SeqCst);
        self.cvar.notify_all();
    }

    pub fn clear_signal(&self) {
        self.signalled
            .store(false, core::sync::atomic::Ordering::SeqCst);
    }
}

impl Platform for StdPlatform {
    fn spawn(&self, name: &'static str, mut body: Box<dyn FnMut() + Send>) {
        let _ = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body())
            .expect("failed to spawn background task");
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn wait(&self, gate: &WaitGate, since: u64) -> Result<()> {
        let mut guard = self.lock.lock().unwrap();
        loop {
            if gate.generation() != since {
                return Ok(());
            }
            if self.signal_pending() {
                return Err(Error::Interrupted);
            }
            let (g, timeout) = self
                .cvar
                .wait_timeout(guard, Duration::from_millis(5))
                .unwrap();
            guard = g;
            let _ = timeout;
        }
    }

    fn sleep_interruptible(&self, millis: u64) -> Result<()> {
        let deadline = std::time::Instant::now() + Duration::from_millis(millis);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            if self.signal_pending() {
                return Err(Error::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(1).min(remaining));
        }
    }

    fn signal_pending(&self) -> bool {
        self.signalled.load(core::sync::atomic::Ordering::SeqCst)
    }
}

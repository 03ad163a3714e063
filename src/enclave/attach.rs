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

//! Address-space attachments (spec §3 lifecycle, §9 "iteration under
//! teardown").

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::hw::PhysAddr;

/// Opaque identifier for one attached address space, supplied by the OS
/// collaborator (spec §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttachmentId(pub u64);

/// A small record added when a process maps the enclave range (spec §3).
/// Kept alive by one reference per mapping; `refcount` additionally
/// tracks in-flight iteration steps so the record survives a concurrent
/// detach until the last reader is done with it.
pub struct Attachment {
    pub id: AttachmentId,
    refcount: AtomicUsize,
}

impl Attachment {
    pub fn new(id: AttachmentId) -> Arc<Self> {
        Arc::new(Self {
            id,
            refcount: AtomicUsize::new(1),
        })
    }

    /// `get_unless_zero` semantics (spec §5): takes a reference unless the
    /// attachment has already been fully released.
    pub fn get_unless_zero(self: &Arc<Self>) -> Option<Arc<Self>> {
        loop {
            let cur = self.refcount.load(Ordering::Acquire);
            if cur == 0 {
                return None;
            }
            if self
                .refcount
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(self.clone());
            }
        }
    }

    pub fn release(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Iterates `attachments` tolerating concurrent detachment: the pattern
/// is "take ref on next, drop ref on previous" (spec §9). `f` returns
/// `true` to keep iterating.
pub fn for_each_live<F: FnMut(&Arc<Attachment>)>(attachments: &[Arc<Attachment>], mut f: F) {
    for a in attachments {
        if let Some(live) = a.get_unless_zero() {
            f(&live);
            live.release();
        }
        // else: the attachment raced with a detach between being
        // snapshotted and iterated; skip it rather than resurrect it.
    }
}

/// The address-space collaborator (spec §6).
pub trait AddressSpaceOps: Send + Sync {
    /// Removes any page-table mapping for `vaddr` in `id`'s address
    /// space, forcing the next access to fault (spec §4.E phase 3).
    fn zap(&self, id: AttachmentId, vaddr: u64);

    /// Tests and clears the hardware "young" bit for `vaddr` in `id`'s
    /// address space, returning whether it was set (spec §4.E phase 2).
    fn test_and_clear_young(&self, id: AttachmentId, vaddr: u64) -> bool;

    /// Installs `phys` as the physical frame backing `vaddr` in `id`'s
    /// address space (spec §4.G).
    fn install_frame(&self, id: AttachmentId, vaddr: u64, phys: PhysAddr);

    /// The set of CPUs that have ever executed within `id`'s address
    /// space, used to scope the write-back shootdown (spec §4.E phase 4).
    fn cpu_set(&self, id: AttachmentId) -> Vec<u32>;
}

/// Forces any in-enclave thread on `cpus` to exit, so that a blocked page
/// is guaranteed out of use before write-back retries (spec §4.E phase 4,
/// §9 O2: any synchronous shootdown mechanism is acceptable).
pub trait Shootdown: Send + Sync {
    fn shootdown(&self, cpus: &[u32]);
}

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

//! The process-wide context object (spec §9 "Global mutable state").
//!
//! The section pool and the reclaim list are process-wide singletons in
//! the original driver, initialized at module load and torn down at
//! unload. Rather than expose them as free-floating globals, they are
//! bundled here into one `Core` that every operation takes a reference
//! to; an embedder owns exactly one `Core` for the whole driver's
//! lifetime.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::enclave::attach::{AddressSpaceOps, AttachmentId, Shootdown};
use crate::enclave::EnclaveInner;
use crate::hw::HardwareOps;
use crate::platform::{Platform, WaitGate};
use crate::reclaim::ReclaimList;
use crate::section::{SectionPool, SectionRange};

/// Everything the core needs that is shared by every enclave.
pub struct Core {
    pub(crate) sections: SectionPool,
    pub(crate) reclaim_list: ReclaimList,
    /// Bumped every time a reclaim batch completes; the allocator waits
    /// on it (spec §4.B, §4.E "signal any allocator waiters").
    pub(crate) progress: WaitGate,
    /// Bumped by the allocator on exhaustion and by reclaim-list
    /// insertion under the low watermark (spec §4.F).
    pub(crate) wake_reclaimer: WaitGate,
    /// Set by `shutdown` to cooperatively stop the reclaimer task
    /// (spec §5 "Cancellation").
    pub(crate) stopping: AtomicBool,
    pub(crate) hw: Arc<dyn HardwareOps>,
    pub(crate) platform: Arc<dyn Platform>,
    address_space: Arc<dyn AddressSpaceOps>,
    shootdown: Arc<dyn Shootdown>,
    /// vma/address-space → enclave lookup (spec §1: "only the
    /// vma→enclave lookup ... is part of the core").
    registry: Mutex<BTreeMap<AttachmentId, Weak<EnclaveInner>>>,
}

impl Core {
    pub fn new(
        sections: &[SectionRange],
        hw: Arc<dyn HardwareOps>,
        platform: Arc<dyn Platform>,
        address_space: Arc<dyn AddressSpaceOps>,
        shootdown: Arc<dyn Shootdown>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sections: SectionPool::new(sections),
            reclaim_list: ReclaimList::new(),
            progress: WaitGate::new(),
            wake_reclaimer: WaitGate::new(),
            stopping: AtomicBool::new(false),
            hw,
            platform,
            address_space,
            shootdown,
            registry: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn sections(&self) -> &SectionPool {
        &self.sections
    }

    pub fn hw(&self) -> &dyn HardwareOps {
        &*self.hw
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) fn address_space(&self) -> &dyn AddressSpaceOps {
        &*self.address_space
    }

    pub(crate) fn shootdown(&self) -> &dyn Shootdown {
        &*self.shootdown
    }

    /// Requests the cooperatively-scheduled reclaimer task to stop
    /// (spec §5).
    pub fn request_shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake_reclaimer.bump();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn register_attachment(&self, id: AttachmentId, enclave: &Arc<EnclaveInner>) {
        self.registry.lock().insert(id, Arc::downgrade(enclave));
    }

    pub(crate) fn unregister_attachment(&self, id: AttachmentId) {
        self.registry.lock().remove(&id);
    }

    /// The vma→enclave lookup (spec §1, §4.G).
    pub fn lookup(&self, id: AttachmentId) -> Option<Arc<EnclaveInner>> {
        self.registry.lock().get(&id)?.upgrade()
    }

    /// Every distinct live enclave reachable through the attachment
    /// registry, de-duplicated (an enclave may have several attachments).
    /// Diagnostic only (spec §3 "Stats snapshot").
    #[cfg(feature = "stats")]
    pub(crate) fn live_enclaves(&self) -> alloc::vec::Vec<Arc<EnclaveInner>> {
        let mut seen = alloc::collections::BTreeSet::new();
        let mut out = alloc::vec::Vec::new();
        for weak in self.registry.lock().values() {
            if let Some(enclave) = weak.upgrade() {
                if seen.insert(Arc::as_ptr(&enclave) as usize) {
                    out.push(enclave);
                }
            }
        }
        out
    }
}

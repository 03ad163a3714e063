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

//! The enclave object and its page table (spec §4.C).

pub mod attach;
pub mod secs;
pub mod sigstruct;
pub mod sinfo;
pub mod va;
pub mod worker;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use spin::Mutex;

use crate::allocator;
use crate::backing::{BackingStore, BackingStoreFactory};
use crate::consts::PAGE_SIZE;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::hash::SignerHasher;
use crate::hw::MeasureMask;
use crate::page::OwnerSlot;

use attach::{for_each_live, Attachment, AttachmentId};
use secs::Secs;
use sigstruct::{SigStruct, Token};
use sinfo::{Class, SecInfo, TcsLayout};
use va::VaPageList;

/// The index of a page within an enclave, i.e. `(vaddr - base) / PAGE_SIZE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(pub u64);

bitflags::bitflags! {
    /// Enclave lifecycle flags (spec §3).
    pub struct EnclaveFlags: u8 {
        const DEBUG       = 1 << 0;
        const INITIALIZED = 1 << 1;
        const DEAD        = 1 << 2;
        const SUSPEND     = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Per-enclave-page flags (spec §3).
    pub struct EnclavePageFlags: u8 {
        const TCS       = 1 << 0;
        const RECLAIMED = 1 << 1;
    }
}

/// One entry of an enclave's address→page map (spec §3).
pub struct EnclavePage {
    pub flags: EnclavePageFlags,
    pub secinfo: SecInfo,
    pub tcs_layout: Option<TcsLayout>,
    /// The bound secure page, or `None` while evicted.
    pub secure_page: Option<crate::page::SecurePageId>,
    pub va_slot: Option<va::VaSlotId>,
}

/// The result of reserving one version-array sealing slot (spec §4.E
/// phase 4).
pub(crate) struct VaSlotAllocation {
    pub id: va::VaSlotId,
    pub page: crate::page::SecurePageId,
    pub slot_index: u32,
}

/// A queued but not-yet-applied `add_page` request (spec §3).
pub struct PendingAddRequest {
    pub page_index: PageIndex,
    pub measurement_mask: MeasureMask,
}

/// Everything the enclave mutex guards (spec §4.C "Concurrency").
pub struct EnclaveState {
    pub page_map: BTreeMap<PageIndex, EnclavePage>,
    pub va_pages: VaPageList,
    pub attachments: Vec<Arc<Attachment>>,
    pub flags: EnclaveFlags,
    pub pending: VecDeque<PendingAddRequest>,
    pub worker_active: bool,
    pub secs_page: Option<crate::page::SecurePageId>,
    /// Count of currently-resident (non-SECS) enclave pages; must equal
    /// `page_map.values().filter(|p| p.secure_page.is_some()).count()`
    /// at every mutex release (spec P3).
    pub child_count: usize,
    pub allowed_attributes: u64,
}

/// Per-enclave state (spec §3 "Enclave").
pub struct EnclaveInner {
    core: Arc<Core>,
    pub base: u64,
    pub size: u64,
    attributes: u64,
    ssa_frame_pages: u32,
    backing: Box<dyn BackingStore>,
    state: Mutex<EnclaveState>,
}

pub type Enclave = Arc<EnclaveInner>;

impl EnclaveInner {
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub(crate) fn state(&self) -> &Mutex<EnclaveState> {
        &self.state
    }

    pub(crate) fn backing(&self) -> &dyn BackingStore {
        &*self.backing
    }

    pub fn page_count(&self) -> u64 {
        self.size / PAGE_SIZE as u64
    }

    /// `(resident, evicted, va_page_count)`, diagnostic only
    /// (spec §3 "Stats snapshot").
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> (usize, usize, usize) {
        let st = self.state.lock();
        let resident = st.page_map.values().filter(|p| p.secure_page.is_some()).count();
        let evicted = st.page_map.len() - resident;
        (resident, evicted, st.va_pages.len())
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().flags.contains(EnclaveFlags::DEAD)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().flags.contains(EnclaveFlags::INITIALIZED)
    }

    /// The physical address of the SECS, or `None` if it has already been
    /// freed (enclave torn down or mid-teardown).
    pub(crate) fn secs_phys(&self) -> Option<u64> {
        let secs_page = self.state.lock().secs_page?;
        let section = self.core.sections().section(secs_page.section);
        Some(section.phys_addr(secs_page.index))
    }

    /// The virtual address a page index is mapped at within this
    /// enclave's range (spec §4.E phase 2/3 attachment walks).
    pub(crate) fn page_vaddr(&self, index: PageIndex) -> u64 {
        self.base + index.0 * PAGE_SIZE as u64
    }

    /// Raises the ceiling used by `init`'s attribute check (spec §4.C
    /// `set_allowed_attribute`, R3: idempotent beyond the first call).
    pub fn set_allowed_attribute(&self, attr: u64) {
        let mut st = self.state.lock();
        st.allowed_attributes |= attr;
    }

    /// Marks the enclave DEAD (spec I5: monotonic, never cleared).
    /// Called by the worker on a failed add/extend, by the power-event
    /// listener, and by a persistent hardware fault during init.
    pub(crate) fn mark_dead(&self) {
        let mut st = self.state.lock();
        st.flags.insert(EnclaveFlags::DEAD);
    }

    /// Power-event hook (spec §4.C `create`, §3 scenario S3): marks the
    /// enclave DEAD and SUSPEND so any in-flight `init` observes
    /// `PowerLost`.
    pub fn on_power_event(&self) {
        let mut st = self.state.lock();
        st.flags.insert(EnclaveFlags::DEAD | EnclaveFlags::SUSPEND);
    }

    /// Attaches an address space to this enclave's range (spec §3
    /// lifecycle "Address-space attachment").
    pub fn attach(self: &Arc<Self>, id: AttachmentId) {
        let attachment = Attachment::new(id);
        self.state.lock().attachments.push(attachment);
        self.core.register_attachment(id, self);
    }

    pub fn detach(&self, id: AttachmentId) {
        let mut st = self.state.lock();
        st.attachments.retain(|a| a.id != id);
        drop(st);
        self.core.unregister_attachment(id);
    }

    pub(crate) fn for_each_attachment<F: FnMut(&Arc<Attachment>)>(&self, f: F) {
        let st = self.state.lock();
        for_each_live(&st.attachments, f);
    }

    /// Creates a new enclave (spec §4.C `create`).
    pub fn create(
        core: Arc<Core>,
        secs: Secs,
        backing_factory: &dyn BackingStoreFactory,
    ) -> Result<Arc<Self>> {
        secs.validate()?;

        let size_pages = secs.size / PAGE_SIZE as u64;
        let backing = backing_factory.create(size_pages)?;

        // Reserve the SECS page before we have a `Weak<Self>` to bind it
        // to; `Arc::new_cyclic` supplies that weak handle to the
        // constructor closure below.
        let secs_page_id = allocator::reserve(&core, true)?;

        let enclave = Arc::new_cyclic(|weak| {
            allocator::bind(&core, secs_page_id, weak.clone(), OwnerSlot::Secs);
            Self {
                core: core.clone(),
                base: secs.base,
                size: secs.size,
                attributes: secs.attributes,
                ssa_frame_pages: secs.ssa_frame_pages,
                backing,
                state: Mutex::new(EnclaveState {
                    page_map: BTreeMap::new(),
                    va_pages: VaPageList::new(),
                    attachments: Vec::new(),
                    flags: EnclaveFlags::empty(),
                    pending: VecDeque::new(),
                    worker_active: false,
                    secs_page: Some(secs_page_id),
                    child_count: 0,
                    allowed_attributes: 0,
                }),
            }
        });

        let section = core.sections().section(secs_page_id.section);
        let status = core
            .hw()
            .create(section.phys_addr(secs_page_id.index), &[0u8; PAGE_SIZE]);
        if !status.is_ok() {
            allocator::free(&core, secs_page_id);
            enclave.mark_dead();
            return Err(Error::HardwareFault);
        }

        debug!("enclave created: base={:#x} size={:#x}", secs.base, secs.size);
        Ok(enclave)
    }

    /// Adds a pending page (spec §4.C `add_page`).
    pub fn add_page(
        self: &Arc<Self>,
        page_index: PageIndex,
        data: &[u8; PAGE_SIZE],
        secinfo: SecInfo,
        tcs_layout: Option<TcsLayout>,
        measurement_mask: MeasureMask,
    ) -> Result<()> {
        secinfo.validate()?;
        if secinfo.class == Class::Tcs {
            let layout = tcs_layout.as_ref().ok_or(Error::InvalidArgument)?;
            layout.validate()?;
        }

        let mut st = self.state.lock();
        if st.flags.contains(EnclaveFlags::DEAD) {
            return Err(Error::Dead);
        }
        if st.flags.contains(EnclaveFlags::INITIALIZED) {
            return Err(Error::InvalidArgument);
        }
        if st.page_map.contains_key(&page_index) {
            return Err(Error::Duplicate);
        }

        self.backing.write(page_index, data)?;

        let flags = if secinfo.class == Class::Tcs {
            EnclavePageFlags::TCS
        } else {
            EnclavePageFlags::empty()
        };
        st.page_map.insert(
            page_index,
            EnclavePage {
                flags,
                secinfo,
                tcs_layout,
                secure_page: None,
                va_slot: None,
            },
        );

        let was_empty = st.pending.is_empty();
        st.pending.push_back(PendingAddRequest {
            page_index,
            measurement_mask,
        });
        drop(st);

        if was_empty {
            worker::spawn(self.clone());
        }
        Ok(())
    }

    /// Initializes the enclave (spec §4.C `init`, §4.H).
    pub fn init(self: &Arc<Self>, sigstruct: &SigStruct, token: &Token) -> Result<()> {
        let allowed = self.state.lock().allowed_attributes;
        if self.attributes & !allowed != 0 {
            return Err(Error::InvalidArgument);
        }

        let mrsigner = SignerHasher::hash_modulus(sigstruct.modulus());
        debug!("init: signer hash = {:02x?}", &mrsigner[..4]);

        worker::flush(self);

        let mut st = self.state.lock();
        if st.flags.contains(EnclaveFlags::DEAD) {
            let suspended = st.flags.contains(EnclaveFlags::SUSPEND);
            drop(st);
            if suspended {
                self.release_bound_pages();
                return Err(Error::PowerLost);
            }
            return Err(Error::HardwareFault);
        }

        let secs_page = st.secs_page.expect("SECS always bound while enclave is alive");
        let section = self.core.sections().section(secs_page.section);
        let phys = section.phys_addr(secs_page.index);

        // Held across the whole retry loop, including its interruptible
        // sleep (spec §4.C "Under the enclave mutex", §4.H): otherwise a
        // concurrent `add_page` could enqueue and spawn a worker that
        // issues an EADD-equivalent while this EINIT-equivalent is still
        // in flight, which is exactly what §5's "per-enclave mutation is
        // serialized by the enclave mutex" rules out.
        let result = crate::init::run(&*self.core, phys, &sigstruct.raw, &token.raw);

        match result {
            Ok(()) => {
                st.flags.insert(EnclaveFlags::INITIALIZED);
                Ok(())
            }
            Err(Error::HardwareFault) => {
                st.flags.insert(EnclaveFlags::DEAD);
                Err(Error::HardwareFault)
            }
            Err(e) => Err(e),
        }
    }

    /// Services a fault on `page_index` (spec §4.G). Returns the physical
    /// address to install, or an error if the page is not resident (the
    /// reload path is intentionally out of scope, spec §9 O1).
    pub(crate) fn resident_phys(&self, page_index: PageIndex) -> Result<u64> {
        let st = self.state.lock();
        if st.flags.contains(EnclaveFlags::DEAD) || !st.flags.contains(EnclaveFlags::INITIALIZED) {
            return Err(Error::HardwareFault);
        }
        let page = st.page_map.get(&page_index).ok_or(Error::HardwareFault)?;
        let secure_page = page.secure_page.ok_or(Error::HardwareFault)?;
        let section = self.core.sections().section(secure_page.section);
        Ok(section.phys_addr(secure_page.index))
    }

    /// Allocates one version-array sealing slot, growing the enclave's
    /// VA page list if the tail page is full (spec §4.E phase 4, §3
    /// "Version-array page"). A new VA page is itself a secure page
    /// allocation and is never marked reclaimable (spec I3).
    pub(crate) fn allocate_va_slot(self: &Arc<Self>) -> core::result::Result<VaSlotAllocation, ()> {
        let core = self.core.clone();
        let weak = Arc::downgrade(self);
        let mut st = self.state.lock();
        let id = st
            .va_pages
            .allocate_slot(|| allocator::allocate(&core, weak.clone(), OwnerSlot::Va, true).map_err(|_| ()))?;
        let page = st.va_pages.page_of(id);
        Ok(VaSlotAllocation {
            id,
            page,
            slot_index: id.slot as u32,
        })
    }

    /// Records that `index` was successfully written back and evicted
    /// (spec §4.E phase 4 "clear the enclave-page's resident binding,
    /// record the version slot ... write back the sealed page and
    /// per-page metadata"). Enforces I6: the binding is cleared before
    /// this returns, so a concurrent fault observes either `None` here
    /// or the pre-eviction resident frame, never a stale one.
    pub(crate) fn mark_evicted(
        &self,
        index: PageIndex,
        va_slot: va::VaSlotId,
        sealed: &[u8; PAGE_SIZE],
        mac: &[u8],
    ) -> core::result::Result<(), ()> {
        {
            let mut st = self.state.lock();
            let page = st.page_map.get_mut(&index).ok_or(())?;
            page.secure_page = None;
            page.flags.insert(EnclavePageFlags::RECLAIMED);
            page.va_slot = Some(va_slot);
            st.child_count = st.child_count.saturating_sub(1);
        }
        self.backing.write(index, sealed).map_err(|_| ())?;
        self.backing.write_metadata(index, mac).map_err(|_| ())?;
        Ok(())
    }

    /// Frees every still-bound secure page (every resident enclave-page
    /// plus the SECS, if not already taken). Idempotent: a page already
    /// released leaves its slot `None` and is skipped. Used both by
    /// power-loss handling in `init` (spec §3 scenario S3) and by
    /// `Drop`, so an enclave that is freed early on power-loss is not
    /// double-freed when its last reference later drops.
    fn release_bound_pages(&self) {
        let mut st = self.state.lock();
        let page_ids: Vec<_> = st
            .page_map
            .values_mut()
            .filter_map(|p| p.secure_page.take())
            .collect();
        for id in page_ids {
            allocator::free(&self.core, id);
        }
        st.child_count = 0;

        if let Some(secs_id) = st.secs_page.take() {
            allocator::free(&self.core, secs_id);
        }
    }
}

impl Drop for EnclaveInner {
    /// Destruction (spec §3 lifecycle, §4.C `release`): frees every
    /// resident page via unconditional free (which issues hardware
    /// remove), then the SECS, and unregisters any attachments still
    /// present.
    fn drop(&mut self) {
        self.release_bound_pages();

        let mut st = self.state.lock();
        let attachments = core::mem::take(&mut st.attachments);
        drop(st);
        for a in attachments {
            self.core.unregister_attachment(a.id);
        }
    }
}

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

//! The reclaim pipeline and reclaimer task (spec §4.E, §4.F).
//!
//! `reclaim_once` runs one batch of up to [`RECLAIM_BATCH`] candidates
//! through the four phases described in §4.E. The reclaimer task (§4.F)
//! just calls it in a loop while the watermark predicate holds.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::allocator;
use crate::consts::{MAC_SIZE, PAGE_SIZE, RECLAIM_BATCH, WATERMARK_HIGH, WATERMARK_LOW};
use crate::core::Core;
use crate::enclave::{EnclaveInner, PageIndex};
use crate::hw::HwStatus;
use crate::page::{OwnerSlot, PageFlags, PageOwner, PageState, SecurePageId};

/// The global ordered set of reclaim candidates (spec §3 "Reclaim list",
/// §4.E). Protected by a single short-held spinlock; only ids live here,
/// never the pages themselves, so contention stays cheap.
pub struct ReclaimList {
    pages: Mutex<VecDeque<SecurePageId>>,
}

impl ReclaimList {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    fn push_back(&self, id: SecurePageId) {
        self.pages.lock().push_back(id);
    }

    /// Detaches `id` if still present (spec §4.B `try_free`).
    pub(crate) fn remove(&self, id: SecurePageId) -> bool {
        let mut list = self.pages.lock();
        if let Some(pos) = list.iter().position(|x| *x == id) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    fn pop_batch(&self, n: usize) -> Vec<SecurePageId> {
        let mut list = self.pages.lock();
        let k = n.min(list.len());
        list.drain(..k).collect()
    }
}

impl Default for ReclaimList {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a freshly bound, non-SECS, non-VA secure page reclaimable and
/// enqueues it on the global list (spec I3). Called once by the
/// add-page worker right after a page becomes resident.
///
/// Also wakes the reclaimer if the pool is already under the low
/// watermark, so pressure does not have to wait for the next allocator
/// exhaustion to start being relieved (spec §4.F).
pub fn mark_reclaimable(core: &Core, id: SecurePageId) {
    let section = core.sections().section(id.section);
    {
        let mut page = section.page(id.index).lock();
        if let PageState::Bound(owner) = &page.state {
            let owner = owner.clone();
            page.flags.insert(PageFlags::RECLAIMABLE);
            page.state = PageState::Reclaimable(owner);
        }
    }
    core.reclaim_list.push_back(id);

    if core.sections().free_count_total() < WATERMARK_LOW {
        core.wake_reclaimer.bump();
    }
}

struct Candidate {
    enclave: Arc<EnclaveInner>,
    id: SecurePageId,
    index: PageIndex,
}

/// Runs one batch of the four-phase eviction pipeline (spec §4.E).
/// Returns the number of pages actually freed, so the reclaimer task can
/// decide whether it made progress.
pub fn reclaim_once(core: &Core) -> usize {
    let candidates = harvest(core);
    if candidates.is_empty() {
        return 0;
    }

    let surviving = age_test(core, candidates);
    let surviving = block(core, surviving);
    let freed = write_back(core, surviving);

    if freed > 0 {
        core.progress.bump();
    }
    freed
}

/// Phase 1 — candidate harvest: pop up to a batch's worth of ids and
/// take a strong reference on each owning enclave.
///
/// A page whose owner's last `Arc` has already dropped concurrently is
/// dropped from consideration (spec §4.E phase 1): by the time the weak
/// upgrade fails, `EnclaveInner::drop` has already synchronously freed
/// every one of its pages, so there is nothing left here to reconcile.
fn harvest(core: &Core) -> Vec<Candidate> {
    let ids = core.reclaim_list.pop_batch(RECLAIM_BATCH);
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let section = core.sections().section(id.section);
        let owner: Option<PageOwner> = {
            let page = section.page(id.index).lock();
            match &page.state {
                PageState::Reclaimable(o) => Some(o.clone()),
                _ => None,
            }
        };
        let Some(owner) = owner else { continue };
        let index = match owner.slot {
            OwnerSlot::Page(idx) => idx,
            // SECS/VA pages are never marked reclaimable (I3); a
            // surviving invariant violation here is a bug, not a race.
            _ => {
                warn!("reclaim: {:?} on reclaim list with non-page owner slot", id);
                continue;
            }
        };
        if let Some(enclave) = owner.enclave.upgrade() {
            out.push(Candidate { enclave, id, index });
        }
    }
    out
}

/// Phase 2 — age test: clears the OS "young" bit across every attached
/// address space; a page found young is returned to the tail of the
/// list rather than evicted this round. An already-DEAD enclave's pages
/// short-circuit straight through (spec §4.E phase 2).
fn age_test(core: &Core, candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut surviving = Vec::with_capacity(candidates.len());
    for c in candidates {
        if c.enclave.is_dead() {
            surviving.push(c);
            continue;
        }

        let vaddr = c.enclave.page_vaddr(c.index);
        let mut young = false;
        c.enclave.for_each_attachment(|a| {
            if core.address_space().test_and_clear_young(a.id, vaddr) {
                young = true;
            }
        });

        if young {
            trace!("reclaim: {:?} young, requeueing", c.id);
            core.reclaim_list.push_back(c.id);
            continue;
        }
        surviving.push(c);
    }
    surviving
}

/// Phase 3 — block: zaps every attachment's page-table entry, then
/// issues the hardware block primitive (spec §4.E phase 3, I7 ordering).
fn block(core: &Core, candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut surviving = Vec::with_capacity(candidates.len());
    for c in candidates {
        let vaddr = c.enclave.page_vaddr(c.index);
        c.enclave.for_each_attachment(|a| {
            core.address_space().zap(a.id, vaddr);
        });

        let section = core.sections().section(c.id.section);
        let phys = section.phys_addr(c.id.index);
        let status = core.hw().block(phys);
        if !status.is_ok() {
            error!("reclaim: block failed for {:?}, leaving resident", c.id);
            core.reclaim_list.push_back(c.id);
            continue;
        }
        surviving.push(c);
    }
    surviving
}

/// Phase 4 — write-back: seals each candidate into a version-array slot
/// and returns its secure page to the section (spec §4.E phase 4, I7).
///
/// Returns the number of pages evicted.
fn write_back(core: &Core, candidates: Vec<Candidate>) -> usize {
    let mut freed = 0;
    for c in candidates {
        match write_back_one(core, &c) {
            Ok(()) => freed += 1,
            Err(()) => {
                // Persistent failure: give the page back to the list
                // instead of leaking it permanently (spec §4.E "log and
                // drop" — resolved in DESIGN.md as "drop this attempt,
                // not the page").
                core.reclaim_list.push_back(c.id);
            }
        }
    }
    freed
}

fn write_back_one(core: &Core, c: &Candidate) -> Result<(), ()> {
    let secs_phys = c.enclave.secs_phys().ok_or(())?;
    let section = core.sections().section(c.id.section);
    let page_phys = section.phys_addr(c.id.index);

    let cpus = {
        let mut cpus = Vec::new();
        c.enclave.for_each_attachment(|a| {
            cpus.extend(core.address_space().cpu_set(a.id));
        });
        cpus.sort_unstable();
        cpus.dedup();
        cpus
    };

    let va_slot = c.enclave.allocate_va_slot()?;
    let va_section = core.sections().section(va_slot.page.section);
    let va_slot_phys = va_section.phys_addr(va_slot.page.index);

    let mut sealed = [0u8; PAGE_SIZE];
    let mut mac = [0u8; MAC_SIZE];

    let mut status = core.hw().write_back(
        secs_phys,
        page_phys,
        va_slot_phys,
        va_slot.slot_index,
        &mut sealed,
        &mut mac,
    );

    if status == HwStatus::NotTracked {
        core.hw().track(secs_phys);
        status = core.hw().write_back(
            secs_phys,
            page_phys,
            va_slot_phys,
            va_slot.slot_index,
            &mut sealed,
            &mut mac,
        );
    }
    if status == HwStatus::NotTracked {
        core.shootdown().shootdown(&cpus);
        status = core.hw().write_back(
            secs_phys,
            page_phys,
            va_slot_phys,
            va_slot.slot_index,
            &mut sealed,
            &mut mac,
        );
    }

    if !status.is_ok() {
        error!("reclaim: write-back persistently failed for {:?}", c.id);
        return Err(());
    }

    c.enclave.mark_evicted(c.index, va_slot.id, &sealed, &mac)?;

    // The write-back primitive already releases the hardware's tracking
    // of this physical page; no EREMOVE is issued on the eviction path
    // (unlike `allocator::free`, which tears an enclave all the way
    // down). Only the section bookkeeping needs updating.
    allocator::reclaim_return(core, c.id);
    debug!("reclaim: evicted page {:?} of enclave (base={:#x})", c.index, c.enclave.base);
    Ok(())
}

/// Sleeps on the watermark predicate, then drains batches until it no
/// longer holds (spec §4.F). Runs as the single reclaimer task; stops
/// cooperatively when `Core::request_shutdown` has been called.
pub fn reclaimer_task(core: Arc<Core>) {
    loop {
        if core.is_stopping() {
            return;
        }

        let predicate = |core: &Core| {
            core.sections().free_count_total() < WATERMARK_HIGH && !core.reclaim_list.is_empty()
        };

        if !predicate(&core) {
            let since = core.wake_reclaimer.generation();
            if core.platform().wait(&core.wake_reclaimer, since).is_err() {
                // Interrupted: loop back around and re-check the stop flag
                // and predicate rather than propagating — the reclaimer
                // has no caller to report to (spec §5 "freezable").
                continue;
            }
            continue;
        }

        while predicate(&core) {
            if core.is_stopping() {
                return;
            }
            reclaim_once(&core);
        }
    }
}

/// Spawns the single long-running reclaimer task (spec §4.F).
pub fn spawn_reclaimer(core: Arc<Core>) {
    core.platform().spawn(
        "sgx-reclaimer",
        Box::new(move || reclaimer_task(core.clone())),
    );
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;
    use crate::enclave::sinfo::{PagePerm, SecInfo};
    use crate::enclave::{worker, EnclavePageFlags, PageIndex};
    use crate::testutil::{FakeHw, HwCall};

    fn add_reg_page_and_wait(enclave: &crate::enclave::Enclave, index: PageIndex) {
        let data = [0u8; PAGE_SIZE];
        let secinfo = SecInfo::reg(PagePerm::R | PagePerm::W);
        enclave
            .add_page(index, &data, secinfo, None, 0)
            .expect("add_page should succeed");
        worker::flush(enclave);
    }

    fn make_enclave_with_hw(
        hw: Arc<FakeHw>,
        page_count: u32,
        base: u64,
        size_pages: u64,
    ) -> (Arc<Core>, crate::enclave::Enclave) {
        let (core, _) = test_core_from_arc(hw, page_count);
        let enclave = crate::testutil::make_enclave(&core, base, size_pages);
        (core, enclave)
    }

    // `testutil::test_core` takes `FakeHw` by value, which loses the
    // handle a test needs to inspect `calls` after the fact; rebuild the
    // same `Core` here but keep the `Arc<FakeHw>` (and, for the age-test
    // case, the concrete `Arc<StdAddressSpace>`) around.
    fn test_core_from_arc(
        hw: Arc<FakeHw>,
        page_count: u32,
    ) -> (Arc<Core>, Arc<crate::host::StdAddressSpace>) {
        use crate::host::{NoopShootdown, StdAddressSpace, StdPlatform};
        use crate::section::SectionRange;
        let address_space = Arc::new(StdAddressSpace::new());
        let core = Core::new(
            &[SectionRange {
                phys_base: 0,
                virt_base: 0,
                page_count,
            }],
            hw,
            StdPlatform::new(),
            address_space.clone(),
            Arc::new(NoopShootdown::default()),
        );
        (core, address_space)
    }

    #[test]
    fn s2_pressure_reclaim_frees_a_page_and_allocation_succeeds() {
        // One section of 2 pages: one taken by the SECS, one by the
        // single resident data page. The pool is now exhausted.
        let hw = Arc::new(FakeHw::default());
        let (core, enclave) = make_enclave_with_hw(hw, 2, 0x4000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        assert_eq!(core.sections().free_count_total(), 0);
        assert_eq!(core.reclaim_list.len(), 1);

        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);
        assert_eq!(core.sections().free_count_total(), 1);
        assert!(core.reclaim_list.is_empty());

        // A subsequent allocation (e.g. a second add-page) can now
        // proceed without blocking.
        let id = crate::allocator::reserve(&core, false).expect("pool has a free page again");
        assert_eq!(core.sections().free_count_total(), 0);
        crate::allocator::free(&core, id);
    }

    #[test]
    fn evicted_page_clears_residency_and_sets_reclaimed_flag() {
        let hw = Arc::new(FakeHw::default());
        let (core, enclave) = make_enclave_with_hw(hw, 3, 0x4000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);

        let st = enclave.state().lock();
        let page = st.page_map.get(&PageIndex(0)).unwrap();
        assert!(page.secure_page.is_none());
        assert!(page.flags.contains(EnclavePageFlags::RECLAIMED));
        assert_eq!(st.child_count, 0);
    }

    #[test]
    fn p5_block_precedes_write_back_for_the_same_page() {
        let hw = Arc::new(FakeHw::default());
        let (core, enclave) = make_enclave_with_hw(hw.clone(), 3, 0x6000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);

        let calls = hw.calls.lock().unwrap();
        let block_pos = calls.iter().position(|c| *c == HwCall::Block).unwrap();
        let wb_pos = calls.iter().position(|c| *c == HwCall::WriteBack).unwrap();
        assert!(block_pos < wb_pos, "block must precede write-back (spec P5)");
    }

    #[test]
    fn not_tracked_retries_via_track_then_succeeds() {
        let mut fake = FakeHw::default();
        fake.not_tracked_until = core::sync::atomic::AtomicU32::new(1);
        let hw = Arc::new(fake);
        let (core, enclave) = make_enclave_with_hw(hw.clone(), 3, 0x6000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);

        let calls = hw.calls.lock().unwrap();
        assert!(calls.iter().any(|c| *c == HwCall::Track));
        assert!(calls.iter().any(|c| *c == HwCall::WriteBack));
    }

    #[test]
    fn not_tracked_twice_falls_through_to_shootdown_then_succeeds() {
        let mut fake = FakeHw::default();
        fake.not_tracked_until = core::sync::atomic::AtomicU32::new(2);
        let hw = Arc::new(fake);
        let (core, enclave) = make_enclave_with_hw(hw, 3, 0x6000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        // Two consecutive `NotTracked` results exhaust the track retry
        // and fall through to a cross-processor shootdown (spec §4.E
        // phase 4) before a third attempt finally succeeds.
        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);
    }

    #[test]
    fn s6_enclave_released_mid_reclaim_survives_via_harvested_refcount() {
        let hw = Arc::new(FakeHw::default());
        let (core, enclave) = make_enclave_with_hw(hw, 3, 0x8000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        assert_eq!(core.reclaim_list.len(), 1);

        // Phase 1 takes a strong reference on the owning enclave before
        // the caller's own handle is dropped.
        let candidates = harvest(&core);
        assert_eq!(candidates.len(), 1);

        // The last external reference drops while the batch is still
        // in flight (spec S6): the candidate's own `Arc` keeps the
        // enclave alive through the remaining phases.
        drop(enclave);

        let surviving = age_test(&core, candidates);
        assert_eq!(surviving.len(), 1);
        let surviving = block(&core, surviving);
        assert_eq!(surviving.len(), 1);
        let freed = write_back(&core, surviving);
        assert_eq!(freed, 1);

        // The batch's `Candidate` was the last strong reference: once
        // `write_back` drops it, the enclave's own teardown runs and
        // frees the SECS page too, so every page in the 3-page pool is
        // free again.
        assert_eq!(core.sections().free_count_total(), 3);
    }

    #[test]
    fn young_page_is_requeued_instead_of_evicted() {
        use crate::enclave::attach::AttachmentId;

        let hw = Arc::new(FakeHw::default());
        let (core, address_space) = test_core_from_arc(hw, 3);
        let enclave = crate::testutil::make_enclave(&core, 0x8000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));

        let id = AttachmentId(1);
        enclave.attach(id);
        address_space.touch(id, enclave.page_vaddr(PageIndex(0)));

        let freed = reclaim_once(&core);
        assert_eq!(freed, 0, "a recently accessed page must not be evicted this round");
        assert_eq!(core.reclaim_list.len(), 1, "it is requeued, not dropped");

        // The young bit was consumed by the test-and-clear; a second
        // round with nothing touching it again evicts it.
        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);
    }

    #[test]
    fn dead_enclaves_page_short_circuits_the_age_test() {
        let hw = Arc::new(FakeHw::default());
        let (core, enclave) = make_enclave_with_hw(hw, 3, 0xA000, 2);
        add_reg_page_and_wait(&enclave, PageIndex(0));
        enclave.mark_dead();

        // A DEAD enclave's page must still be evicted promptly rather
        // than wait for an access pattern that will never come (spec
        // §4.E phase 2 "short-circuit directly to eviction").
        let freed = reclaim_once(&core);
        assert_eq!(freed, 1);
    }
}

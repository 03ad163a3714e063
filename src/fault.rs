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

//! The page-fault path (spec §4.G).
//!
//! The only two pieces of the address-space/VMA layer that are part of
//! the core (spec §1): the attachment→enclave lookup, and this entry
//! point. Everything else about VMA registration and lifecycle is the OS
//! collaborator's problem.

use crate::consts::PAGE_SIZE;
use crate::core::Core;
use crate::enclave::attach::AttachmentId;
use crate::enclave::PageIndex;
use crate::error::{Error, Result};

/// Services a fault at `vaddr` within the enclave range attached as
/// `attachment` (spec §4.G). On success, the resident secure page's
/// physical frame has been installed into the faulting address space
/// ("NOPAGE" in the original wording). A non-resident page bus-errors in
/// this version of the core; the reload path is intentionally out of
/// scope (spec §9 O1).
pub fn handle(core: &Core, attachment: AttachmentId, vaddr: u64) -> Result<()> {
    let enclave = core.lookup(attachment).ok_or(Error::HardwareFault)?;

    if enclave.is_dead() || !enclave.is_initialized() {
        return Err(Error::HardwareFault);
    }
    if vaddr < enclave.base || vaddr >= enclave.base + enclave.size {
        return Err(Error::InvalidArgument);
    }

    let index = PageIndex((vaddr - enclave.base) / PAGE_SIZE as u64);
    let phys = enclave.resident_phys(index)?;
    core.address_space().install_frame(attachment, vaddr, phys);
    Ok(())
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::enclave::secs::{Attributes, Secs};
    use crate::enclave::sigstruct::{SigStruct, Token};
    use crate::enclave::sinfo::{PagePerm, SecInfo};
    use crate::enclave::{worker, Enclave, EnclaveInner};
    use crate::host::{NoopShootdown, StdAddressSpace, StdBackingStoreFactory, StdPlatform};
    use crate::section::SectionRange;
    use crate::testutil::FakeHw;
    use alloc::sync::Arc;

    fn build(page_count: u32) -> (Arc<Core>, Arc<StdAddressSpace>) {
        let address_space = Arc::new(StdAddressSpace::new());
        let core = Core::new(
            &[SectionRange {
                phys_base: 0,
                virt_base: 0,
                page_count,
            }],
            Arc::new(FakeHw::default()),
            StdPlatform::new(),
            address_space.clone(),
            Arc::new(NoopShootdown::default()),
        );
        (core, address_space)
    }

    fn make_enclave(core: &Arc<Core>, base: u64, size_pages: u64) -> Enclave {
        let secs = Secs {
            base,
            size: size_pages * PAGE_SIZE as u64,
            attributes: Attributes::MODE64BIT.bits(),
            xfrm: 0x3,
            misc_select: 0,
            ssa_frame_pages: 1,
        };
        EnclaveInner::create(core.clone(), secs, &StdBackingStoreFactory).unwrap()
    }

    fn init_with_one_page(core: &Arc<Core>, enclave: &Enclave) {
        let data = [0u8; PAGE_SIZE];
        enclave
            .add_page(PageIndex(0), &data, SecInfo::reg(PagePerm::R | PagePerm::W), None, 0)
            .unwrap();
        worker::flush(enclave);
        enclave.set_allowed_attribute(Attributes::MODE64BIT.bits());
        let sigstruct = SigStruct {
            modulus: [0u8; crate::consts::MODULUS_SIZE],
            exponent: 0,
            signature: [0u8; crate::consts::MODULUS_SIZE],
            raw: alloc::vec![0u8; 8],
        };
        let token = Token { raw: alloc::vec![0u8; 8] };
        enclave.init(&sigstruct, &token).unwrap();
        let _ = core;
    }

    #[test]
    fn s1_fault_on_resident_page_installs_the_bound_frame() {
        let (core, address_space) = build(3);
        let enclave = make_enclave(&core, 0x2000, 2);
        init_with_one_page(&core, &enclave);

        let id = AttachmentId(1);
        enclave.attach(id);
        let vaddr = enclave.page_vaddr(PageIndex(0));

        handle(&core, id, vaddr).expect("fault on a resident page should succeed");
        assert!(address_space.installed_frame(id, vaddr).is_some());
    }

    #[test]
    fn fault_on_unknown_attachment_bus_errors() {
        let (core, _) = build(3);
        let result = handle(&core, AttachmentId(99), 0x2000);
        assert_eq!(result, Err(Error::HardwareFault));
    }

    #[test]
    fn fault_before_init_bus_errors() {
        let (core, _) = build(3);
        let enclave = make_enclave(&core, 0x2000, 2);
        let id = AttachmentId(2);
        enclave.attach(id);

        let result = handle(&core, id, enclave.page_vaddr(PageIndex(0)));
        assert_eq!(result, Err(Error::HardwareFault));
    }

    #[test]
    fn fault_outside_the_enclave_range_is_invalid_argument() {
        let (core, _) = build(3);
        let enclave = make_enclave(&core, 0x2000, 2);
        init_with_one_page(&core, &enclave);

        let id = AttachmentId(3);
        enclave.attach(id);
        let result = handle(&core, id, enclave.base + enclave.size);
        assert_eq!(result, Err(Error::InvalidArgument));
    }

    #[test]
    fn fault_on_dead_enclave_bus_errors() {
        let (core, _) = build(3);
        let enclave = make_enclave(&core, 0x2000, 2);
        init_with_one_page(&core, &enclave);
        enclave.mark_dead();

        let id = AttachmentId(4);
        enclave.attach(id);
        let result = handle(&core, id, enclave.page_vaddr(PageIndex(0)));
        assert_eq!(result, Err(Error::HardwareFault));
    }

    #[test]
    fn fault_on_evicted_page_bus_errors_reload_path_is_out_of_scope() {
        let (core, _) = build(3);
        let enclave = make_enclave(&core, 0x2000, 2);
        init_with_one_page(&core, &enclave);

        let freed = crate::reclaim::reclaim_once(&core);
        assert_eq!(freed, 1);

        let id = AttachmentId(5);
        enclave.attach(id);
        let result = handle(&core, id, enclave.page_vaddr(PageIndex(0)));
        assert_eq!(result, Err(Error::HardwareFault));
    }
}

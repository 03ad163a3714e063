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

//! The enclave control structure input (spec §4.C `create`).

use crate::consts::PAGE_SIZE;
use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Enclave attribute bits (spec §4.C, §4.H).
    pub struct Attributes: u64 {
        const DEBUG      = 1 << 1;
        const MODE64BIT  = 1 << 2;
        const PROVISION_KEY = 1 << 4;
        const EINIT_TOKEN_KEY = 1 << 5;
        /// Reserved bits that must always be clear.
        const RESERVED = 0xFFFF_FFFF_FFFF_FF09;
    }
}

/// Caller-supplied SECS input to `create` (spec §3, §4.C).
#[derive(Debug, Copy, Clone)]
pub struct Secs {
    pub base: u64,
    pub size: u64,
    pub attributes: u64,
    pub xfrm: u64,
    pub misc_select: u32,
    pub ssa_frame_pages: u32,
}

impl Secs {
    /// Validates size/base shape, reserved bits, and SSA frame adequacy
    /// (spec §4.C, B1).
    pub fn validate(&self) -> Result<()> {
        if self.size < 2 * PAGE_SIZE as u64 || !self.size.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        if self.base % self.size != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.attributes & Attributes::RESERVED.bits() != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.attributes & Attributes::MODE64BIT.bits() == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.ssa_frame_pages == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// `attributes & ~allowed == 0` (spec §4.C `init`, B2).
    pub fn attributes_allowed(&self, allowed: u64) -> bool {
        self.attributes & !allowed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_secs() -> Secs {
        Secs {
            base: 2 * PAGE_SIZE as u64,
            size: 2 * PAGE_SIZE as u64,
            attributes: Attributes::MODE64BIT.bits(),
            xfrm: 0x3,
            misc_select: 0,
            ssa_frame_pages: 1,
        }
    }

    #[test]
    fn b1_aligned_base_is_accepted() {
        assert!(base_secs().validate().is_ok());
    }

    #[test]
    fn b1_misaligned_base_is_rejected() {
        let mut s = base_secs();
        s.base = PAGE_SIZE as u64;
        assert_eq!(s.validate(), Err(Error::InvalidArgument));
    }

    #[test]
    fn non_power_of_two_size_is_rejected() {
        let mut s = base_secs();
        s.size = 3 * PAGE_SIZE as u64;
        s.base = 0;
        assert_eq!(s.validate(), Err(Error::InvalidArgument));
    }

    #[test]
    fn b2_attribute_outside_mask_is_rejected() {
        let s = base_secs();
        assert!(!s.attributes_allowed(0));
        assert!(s.attributes_allowed(Attributes::MODE64BIT.bits()));
    }

    #[rstest::rstest]
    #[case(2 * PAGE_SIZE as u64)]
    #[case(4 * PAGE_SIZE as u64)]
    #[case(1024 * PAGE_SIZE as u64)]
    fn b1_power_of_two_sizes_at_matching_alignment_are_accepted(#[case] size: u64) {
        let s = Secs {
            size,
            base: size,
            ..base_secs()
        };
        assert!(s.validate().is_ok());
    }

    #[rstest::rstest]
    #[case(1 << 6)]
    #[case(1 << 10)]
    #[case(1 << 40)]
    fn b1_reserved_attribute_bits_are_rejected(#[case] extra_bits: u64) {
        let mut s = base_secs();
        s.attributes |= extra_bits;
        assert_eq!(s.validate(), Err(Error::InvalidArgument));
    }
}

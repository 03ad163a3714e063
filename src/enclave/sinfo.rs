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

//! Page security info (spec §4.C `add_page` validation).
//!
//! Layout mirrors how `enarx-sgx` splits the hardware `SECINFO.FLAGS`
//! field into a class and a permission set for easier manipulation.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::error::{Error, Result};

bitflags! {
    /// Page permission bits (W implies the hardware also requires R).
    pub struct PagePerm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

/// The type of a page being added (spec §3, §4.C).
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Class {
    Tcs = 1,
    Reg = 2,
}

/// A 64-byte-aligned copy of the per-page security info supplied to
/// `add_page` (spec §3 "secinfo copy (64-byte aligned)").
#[derive(Debug, Copy, Clone)]
#[repr(C, align(64))]
pub struct SecInfo {
    pub class: Class,
    pub perm: PagePerm,
}

const_assert!(core::mem::align_of::<SecInfo>() == 64);

impl SecInfo {
    pub const fn reg(perm: PagePerm) -> Self {
        Self {
            class: Class::Reg,
            perm,
        }
    }

    pub const fn tcs() -> Self {
        Self {
            class: Class::Tcs,
            perm: PagePerm::empty(),
        }
    }

    /// Validates known page type, the W→R implication, and that no
    /// reserved permission bit is set (spec §4.C).
    pub fn validate(&self) -> Result<()> {
        if self.perm.contains(PagePerm::W) && !self.perm.contains(PagePerm::R) {
            return Err(Error::InvalidArgument);
        }
        match self.class {
            Class::Tcs if !self.perm.is_empty() => Err(Error::InvalidArgument),
            Class::Tcs | Class::Reg => Ok(()),
        }
    }
}

/// Extra fields validated only for `Class::Tcs` pages (spec §4.C).
#[derive(Debug, Copy, Clone)]
pub struct TcsLayout {
    pub ssa_offset: u64,
    pub fs_offset: u64,
    pub fs_limit: u32,
    pub gs_offset: u64,
    pub gs_limit: u32,
}

impl TcsLayout {
    /// Requires FS/GS limits to be `0xFFF`-terminated (spec §4.C).
    pub fn validate(&self) -> Result<()> {
        if self.fs_limit != 0xFFF || self.gs_limit != 0xFFF {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

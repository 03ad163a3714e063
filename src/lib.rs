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

//! Core allocator, enclave object and reclaim pipeline for a
//! secure-page multiplexing driver.
//!
//! This crate is the multiplexer described in spec §1: it owns the
//! bounded pool of hardware secure pages, the per-enclave page table and
//! backing-file mirror, the reclaim pipeline, the page-fault path, the
//! async add-page worker and the init retry loop. Everything the
//! original driver treats as an external collaborator (the ioctl
//! dispatcher, VMA registration, the hash primitive beyond the signer
//! hash, the privileged instruction wrappers) is modeled as a trait an
//! embedder implements — see [`hw::HardwareOps`], [`enclave::attach::AddressSpaceOps`],
//! [`backing::BackingStore`] and [`platform::Platform`].
//!
//! An embedder builds one [`core::Core`] for the whole driver's lifetime
//! (spec §9 "Global mutable state"), spawns the reclaimer task with
//! [`reclaim::spawn_reclaimer`], and routes the four ioctl commands
//! through the adapters in [`ioctl`] into [`enclave::EnclaveInner`].

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod allocator;
pub mod backing;
pub mod consts;
pub mod core;
pub mod enclave;
pub mod error;
pub mod fault;
pub mod hash;
pub mod hw;
pub mod init;
pub mod ioctl;
pub mod page;
pub mod platform;
pub mod reclaim;
pub mod section;

#[cfg(feature = "stats")]
pub mod stats;

#[cfg(feature = "std")]
pub mod host;

#[cfg(test)]
mod testutil;

pub use crate::core::Core;
pub use crate::enclave::{Enclave, EnclaveInner};
pub use crate::error::{Error, Result};

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

//! The backing-file collaborator (spec §6, §3 "Persisted state").
//!
//! Layout: `size` page-sized slots, followed by `size / 32` bytes of
//! per-page sealing metadata, one byte-range per sealed page (spec §6).

use alloc::boxed::Box;

use crate::consts::PAGE_SIZE;
use crate::enclave::PageIndex;
use crate::error::Result;

/// Per-enclave backing storage: an anonymous shared-memory file large
/// enough for `size + size/32` bytes, accessed through the page cache.
pub trait BackingStore: Send + Sync {
    /// Pins and reads one data page. Concurrent reads are always safe.
    fn pin_read(&self, index: PageIndex, out: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes one data page and marks it dirty. Serialized by the
    /// enclave mutex at the call site because it is always paired with a
    /// hardware op (spec §5).
    fn write(&self, index: PageIndex, data: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Writes the sealing metadata slot for a written-back page.
    fn write_metadata(&self, index: PageIndex, meta: &[u8]) -> Result<()>;

    /// Reads the sealing metadata slot for a written-back page.
    fn read_metadata(&self, index: PageIndex, meta: &mut [u8]) -> Result<()>;
}

/// Creates the per-enclave backing file (spec §4.C `create`).
pub trait BackingStoreFactory: Send + Sync {
    /// `size_pages` is the enclave's page count; the factory is
    /// responsible for sizing the file to `size + size/32` bytes.
    fn create(&self, size_pages: u64) -> Result<Box<dyn BackingStore>>;
}

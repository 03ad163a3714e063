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

//! Core tunables (spec §2, §4.E, §4.H).

/// Size in bytes of one secure page, matching the platform page size.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of firmware-described sections the pool can hold.
pub const MAX_SECTIONS: usize = 8;

/// Number of sealing slots held by a single version-array page.
pub const VA_SLOT_COUNT: usize = PAGE_SIZE / 8;

/// Number of 256-byte chunks in a page, i.e. the width of the measurement
/// mask (spec §4.D).
pub const MEASURE_CHUNKS: usize = 16;

/// Size in bytes of one measurement chunk.
pub const MEASURE_CHUNK_SIZE: usize = PAGE_SIZE / MEASURE_CHUNKS;

/// Reclaimer batch size (spec §4.E).
pub const RECLAIM_BATCH: usize = 16;

/// Low watermark, in free pages, below which adding a page to the reclaim
/// list also wakes the reclaimer (spec §4.F).
pub const WATERMARK_LOW: usize = 32;

/// High watermark, in free pages, the reclaimer sleeps at (spec §4.F).
pub const WATERMARK_HIGH: usize = 64;

/// Outer retry count for the init loop (spec §4.H).
pub const SLEEP_COUNT: u32 = 50;

/// Inner spin count per outer iteration of the init loop (spec §4.H).
pub const SPIN_COUNT: u32 = 20;

/// Sleep duration, in milliseconds, between init retry iterations.
pub const SLEEP_TIME_MS: u64 = 20;

/// Size in bytes of the RSA modulus the signer hash is computed over
/// (spec §6).
pub const MODULUS_SIZE: usize = 384;

/// Size in bytes of the MAC a write-back primitive produces alongside
/// the sealed page contents (spec §4.E phase 4).
pub const MAC_SIZE: usize = 16;

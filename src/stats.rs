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

//! A read-only diagnostic snapshot (spec §3 "Stats snapshot",
//! `stats` Cargo feature). Never on the hot path and never consulted by
//! any invariant; this exists purely for a `sgxtop`-style tool to render,
//! the way the example pack's `sgxtop-rs` walks `/sys` to report the
//! same shape of numbers for the real driver.

use alloc::vec::Vec;

use crate::core::Core;

/// Free/total pages for one section.
pub struct SectionStats {
    pub index: u8,
    pub free_count: usize,
    pub page_count: usize,
}

/// Resident/evicted page counts for one live enclave.
pub struct EnclaveStats {
    pub base: u64,
    pub resident: usize,
    pub evicted: usize,
    pub va_pages: usize,
}

/// A point-in-time snapshot across the whole core.
pub struct Stats {
    pub sections: Vec<SectionStats>,
    pub reclaimable: usize,
    pub enclaves: Vec<EnclaveStats>,
}

/// Takes a snapshot. Each field is read under its own lock for the
/// instant of the call; there is no global quiescence, so the numbers
/// are a best-effort approximation, same as any `/proc`-style counter.
pub fn snapshot(core: &Core) -> Stats {
    let sections = core
        .sections()
        .sections()
        .iter()
        .map(|s| SectionStats {
            index: s.index(),
            free_count: s.free_count(),
            page_count: s.page_count(),
        })
        .collect();

    let enclaves = core
        .live_enclaves()
        .into_iter()
        .map(|e| {
            let (resident, evicted, va_pages) = e.stats();
            EnclaveStats {
                base: e.base,
                resident,
                evicted,
                va_pages,
            }
        })
        .collect();

    Stats {
        sections,
        reclaimable: core.reclaim_list.len(),
        enclaves,
    }
}

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

//! The scheduling collaborator (spec §5, §6).
//!
//! The core never assumes kthreads, a specific async runtime, or a wall
//! clock. Every suspension point — the allocator's wait for reclaimer
//! progress, the init retry sleep, the reclaimer's idle wait, the
//! add-page worker's scheduler yield — goes through this trait.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// A condition-variable-like rendezvous point. The core only ever reads
/// and compares the generation counter; a `Platform` implementation is
/// free to back it with a real wait queue, a futex, or a busy spin.
#[derive(Default)]
pub struct WaitGate {
    generation: AtomicU64,
}

impl WaitGate {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// The current generation, to be passed back into `Platform::wait`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bumps the generation, waking anyone parked on a prior value.
    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// The scheduling / interruption collaborator.
///
/// Implementations must be safe to call from the add-page worker, the
/// reclaimer task, and arbitrary caller threads running `init`/`allocate`
/// concurrently.
pub trait Platform: Send + Sync {
    /// Spawns a long-running background task under `name`. Used for the
    /// per-enclave add-page worker and the single reclaimer task. The
    /// returned value is never inspected by the core; it exists purely so
    /// an embedder can track/join tasks if desired.
    fn spawn(&self, name: &'static str, body: Box<dyn FnMut() + Send>);

    /// Cooperative yield point used by the add-page worker between
    /// requests (spec §4.D, §9 O3).
    fn yield_now(&self);

    /// Blocks until `gate`'s generation differs from `since`, or the
    /// calling thread's pending signal is observed. Returns
    /// `Err(Interrupted)` in the latter case.
    fn wait(&self, gate: &WaitGate, since: u64) -> Result<()>;

    /// Interruptibly sleeps for `millis` milliseconds (spec §4.H).
    /// Returns `Err(Interrupted)` if a signal was delivered during the
    /// sleep.
    fn sleep_interruptible(&self, millis: u64) -> Result<()>;

    /// Whether the calling thread has a signal pending (checked by the
    /// allocator wait and the init retry loop).
    fn signal_pending(&self) -> bool;
}

/// Helper used by callers that just want "wait until woken or
/// interrupted", hiding the generation bookkeeping.
pub fn wait_on(platform: &dyn Platform, gate: &WaitGate) -> Result<()> {
    let since = gate.generation();
    if platform.signal_pending() {
        return Err(Error::Interrupted);
    }
    platform.wait(gate, since)
}

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

//! Error kinds shared by every component of the core (spec §7).

use core::fmt;

/// The semantic error kinds the core ever returns.
///
/// Variant names follow spec §7; they are not a 1:1 mirror of any single
/// hardware status or `errno` value, since several hardware statuses are
/// absorbed internally (see [`Error::from_hw`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Validation failure in create/add_page/init.
    InvalidArgument,
    /// The page allocator is exhausted, even after a reclaim attempt.
    OutOfMemory,
    /// `add_page` targeted an address that already has a page.
    Duplicate,
    /// The operation targeted an enclave that is already `DEAD`.
    Dead,
    /// A blocking wait was aborted by a signal.
    Interrupted,
    /// The enclave was suspended by a power-event; operations on it fail
    /// with this code until it is released.
    PowerLost,
    /// A hardware primitive returned a fatal status. The enclave carrying
    /// this page has already been marked `DEAD` by the caller.
    HardwareFault,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "secure page pool exhausted",
            Error::Duplicate => "page already present at this address",
            Error::Dead => "enclave is dead",
            Error::Interrupted => "interrupted by signal",
            Error::PowerLost => "enclave suspended by power event",
            Error::HardwareFault => "hardware primitive returned a fatal status",
        };
        f.write_str(msg)
    }
}

impl Error {
    /// Maps to the user-visible exit code the ioctl adapter returns (spec §7).
    pub const fn to_errno(self) -> i32 {
        match self {
            Error::InvalidArgument => -EINVAL,
            Error::OutOfMemory => -ENOMEM,
            Error::Duplicate => -EINVAL,
            Error::Dead => -EINVAL,
            Error::Interrupted => -ERESTARTSYS,
            Error::PowerLost => -EPOWERLOST,
            Error::HardwareFault => -EFAULT,
        }
    }
}

const EINVAL: i32 = 22;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const ERESTARTSYS: i32 = 512;
/// Dedicated power-loss code (spec §7); not a real POSIX errno, chosen
/// outside the standard errno range the way the hardware fault/power-loss
/// codes are in the original driver.
const EPOWERLOST: i32 = 1000;

pub type Result<T> = core::result::Result<T, Error>;

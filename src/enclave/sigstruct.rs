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

//! The enclave signature structure consumed by `init` (spec §4.C, §6).

use crate::consts::MODULUS_SIZE;

/// The signature structure an enclave author attaches to their image.
/// Only the fields `init` actually consults are modeled; everything else
/// the hardware primitive needs is opaque to the core and passed through
/// verbatim.
#[derive(Clone)]
pub struct SigStruct {
    pub modulus: [u8; MODULUS_SIZE],
    pub exponent: u32,
    pub signature: [u8; MODULUS_SIZE],
    /// The raw bytes handed to the hardware `init` primitive.
    pub raw: alloc::vec::Vec<u8>,
}

impl SigStruct {
    pub fn modulus(&self) -> &[u8; MODULUS_SIZE] {
        &self.modulus
    }
}

/// The EINIT token the dispatcher allocates alongside the sigstruct
/// (spec §6 `INIT`). Opaque to the core beyond its raw bytes.
#[derive(Clone, Default)]
pub struct Token {
    pub raw: alloc::vec::Vec<u8>,
}

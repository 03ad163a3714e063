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

//! The signer-identity hasher (spec §6, §4.I).
//!
//! Unlike the hardware/OS traits, SHA-256 has no platform dependency, so
//! it is implemented directly against `sha2` (in `force-soft` mode, as
//! the teacher crate uses it) rather than abstracted behind a trait.

use crate::consts::MODULUS_SIZE;
use sha2::{Digest, Sha256};

/// Computes the signer hash (`mrsigner`) over a signature's RSA modulus.
pub struct SignerHasher {
    inner: Sha256,
}

impl SignerHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Hashes a `MODULUS_SIZE`-byte RSA modulus (spec §6).
    pub fn hash_modulus(modulus: &[u8; MODULUS_SIZE]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&modulus[..]);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> [u8; 32] {
        let digest = self.inner.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

impl Default for SignerHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_modulus_is_deterministic() {
        let modulus = [7u8; MODULUS_SIZE];
        let a = SignerHasher::hash_modulus(&modulus);
        let b = SignerHasher::hash_modulus(&modulus);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_modulus_is_sensitive_to_input() {
        let a = SignerHasher::hash_modulus(&[7u8; MODULUS_SIZE]);
        let b = SignerHasher::hash_modulus(&[8u8; MODULUS_SIZE]);
        assert_ne!(a, b);
    }
}

// Copyright (c) 2024, The QuicFuscate Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Crypto Module
//!
//! The AEAD selector picks one concrete cipher primitive at construction
//! time based on detected CPU capability and hides the choice behind a
//! uniform `encrypt`/`decrypt` contract. There is no runtime polymorphism
//! hierarchy; the selected primitive is a tagged enum dispatched on in two
//! small match arms.

use crate::error::{CryptoError, QuicFuscateError, Result};
use crate::optimize::{CpuFeature, FeatureDetector};
use aead::{Aead, KeyInit, Payload};
use aegis::{aegis128l::Aegis128L, aegis128x::Aegis128X};
use morus::Morus;
use rand::{rngs::OsRng, RngCore};

pub const TAG_LEN: usize = 16;

/// The concrete AEAD primitive chosen at construction. Selection priority:
/// a 256-bit vector-AES-capable path, then a 128-bit AES-NI/ARMv8 path, then
/// a pure-software fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aegis128X,
    Aegis128L,
    Morus1280_128,
}

impl CipherSuite {
    /// Key and nonce length required by this primitive. AEGIS-128L and
    /// MORUS-1280-128 use 16 bytes; AEGIS-128X's wider internal state
    /// requires 32 bytes.
    pub fn key_nonce_len(self) -> usize {
        match self {
            CipherSuite::Aegis128X => 32,
            CipherSuite::Aegis128L | CipherSuite::Morus1280_128 => 16,
        }
    }
}

/// Selects and holds the AEAD primitive for the lifetime of a connection.
/// The choice never changes after construction.
pub struct CipherSuiteSelector {
    selected: CipherSuite,
}

impl CipherSuiteSelector {
    pub fn new() -> Self {
        let detector = FeatureDetector::instance();
        let selected = if detector.has_feature(CpuFeature::VAES) {
            CipherSuite::Aegis128X
        } else if detector.has_feature(CpuFeature::AESNI) || detector.has_feature(CpuFeature::NEON) {
            CipherSuite::Aegis128L
        } else {
            CipherSuite::Morus1280_128
        };

        let mask = [CpuFeature::AVX, CpuFeature::AVX2, CpuFeature::AVX512F, CpuFeature::VAES, CpuFeature::AESNI, CpuFeature::PCLMULQDQ, CpuFeature::NEON]
            .iter()
            .enumerate()
            .fold(0i64, |acc, (bit, feature)| if detector.has_feature(*feature) { acc | (1 << bit) } else { acc });
        crate::telemetry::record_cpu_features(mask, selected != CipherSuite::Morus1280_128);

        Self { selected }
    }

    /// Diagnostic accessor only; the selector never otherwise exposes which
    /// primitive it chose.
    pub fn diagnostic_suite(&self) -> CipherSuite {
        self.selected
    }

    pub fn key_nonce_len(&self) -> usize {
        self.selected.key_nonce_len()
    }

    /// Encrypts `plaintext`, returning ciphertext with the 16-byte tag
    /// appended.
    pub fn encrypt(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let expect = self.selected.key_nonce_len();
        if key.len() != expect || nonce.len() != expect {
            return Err(QuicFuscateError::Crypto(CryptoError::KeyDerivationFail));
        }
        match self.selected {
            CipherSuite::Aegis128X => {
                let key: &[u8; 32] = key.try_into().unwrap();
                let nonce: &[u8; 32] = nonce.try_into().unwrap();
                let cipher = Aegis128X::new(key, nonce);
                let (mut ciphertext, tag) = cipher.encrypt(plaintext, aad);
                ciphertext.extend_from_slice(&tag);
                Ok(ciphertext)
            }
            CipherSuite::Aegis128L => {
                let key: &[u8; 16] = key.try_into().unwrap();
                let nonce: &[u8; 16] = nonce.try_into().unwrap();
                let cipher = Aegis128L::new(key, nonce);
                let (mut ciphertext, tag) = cipher.encrypt(plaintext, aad);
                ciphertext.extend_from_slice(&tag);
                Ok(ciphertext)
            }
            CipherSuite::Morus1280_128 => {
                let key: &[u8; 16] = key.try_into().unwrap();
                let nonce: &[u8; 16] = nonce.try_into().unwrap();
                let mut cipher = Morus::new(key, nonce);
                let (mut ciphertext, tag) = cipher.encrypt(plaintext, aad);
                ciphertext.extend_from_slice(&tag);
                Ok(ciphertext)
            }
        }
    }

    /// Decrypts `ciphertext` (tag appended), returning the plaintext or
    /// `CryptoError::AuthFail`.
    pub fn decrypt(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let expect = self.selected.key_nonce_len();
        if key.len() != expect || nonce.len() != expect {
            return Err(QuicFuscateError::Crypto(CryptoError::KeyDerivationFail));
        }
        if ciphertext.len() < TAG_LEN {
            return Err(QuicFuscateError::Crypto(CryptoError::AuthFail));
        }
        let payload = Payload { msg: ciphertext, aad };
        let auth_fail = || QuicFuscateError::Crypto(CryptoError::AuthFail);
        match self.selected {
            CipherSuite::Aegis128X => {
                let key: &[u8; 32] = key.try_into().unwrap();
                let nonce: &[u8; 32] = nonce.try_into().unwrap();
                let cipher = Aegis128X::new(key, nonce);
                let (body, tag_slice) = payload.msg.split_at(payload.msg.len() - TAG_LEN);
                let tag = aegis::Tag::from_slice(tag_slice);
                cipher.decrypt(body, &tag, payload.aad).map_err(|_| auth_fail())
            }
            CipherSuite::Aegis128L => {
                let key: &[u8; 16] = key.try_into().unwrap();
                let nonce: &[u8; 16] = nonce.try_into().unwrap();
                let cipher = Aegis128L::new(key, nonce);
                let (body, tag_slice) = payload.msg.split_at(payload.msg.len() - TAG_LEN);
                let tag = aegis::Tag::from_slice(tag_slice);
                cipher.decrypt(body, &tag, payload.aad).map_err(|_| auth_fail())
            }
            CipherSuite::Morus1280_128 => {
                let key: &[u8; 16] = key.try_into().unwrap();
                let nonce: &[u8; 16] = nonce.try_into().unwrap();
                let mut cipher = Morus::new(key, nonce);
                let (body, tag_slice) = payload.msg.split_at(payload.msg.len() - TAG_LEN);
                let tag: &[u8; 16] = tag_slice.try_into().unwrap();
                cipher.decrypt(body, tag, payload.aad).map_err(|_| auth_fail())
            }
        }
    }
}

impl Default for CipherSuiteSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates session-specific random material (probe ids, padding bytes).
/// AEAD traffic keys themselves come from the TLS key schedule via the
/// `TlsEngine` collaborator, not from here.
pub struct CryptoManager;

impl CryptoManager {
    pub fn new() -> Self {
        Self
    }

    pub fn random_bytes(&self, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        OsRng.fill_bytes(&mut out);
        out
    }
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let selector = CipherSuiteSelector::new();
        let len = selector.key_nonce_len();
        let key = vec![0x42u8; len];
        let nonce = vec![0x24u8; len];
        let aad = b"connection-id";
        let plaintext = b"hello quicfuscate";

        let ciphertext = selector.encrypt(&key, &nonce, aad, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
        let recovered = selector.decrypt(&key, &nonce, aad, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let selector = CipherSuiteSelector::new();
        let len = selector.key_nonce_len();
        let key = vec![1u8; len];
        let nonce = vec![2u8; len];
        let mut ciphertext = selector.encrypt(&key, &nonce, b"", b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(selector.decrypt(&key, &nonce, b"", &ciphertext).is_err());
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let selector = CipherSuiteSelector::new();
        assert!(selector.encrypt(&[0u8; 3], &[0u8; 3], b"", b"x").is_err());
    }
}

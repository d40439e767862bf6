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

//! # Optimization Module
//!
//! Runtime CPU feature detection and dispatch, used by the AEAD selector
//! (`crypto`) to pick a cipher primitive. Cache-alignment, thread-pool and
//! zero-copy scaffolding are deliberately not carried here: they are
//! performance scaffolding, not part of this system's design.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Once;
#[cfg(target_arch = "aarch64")]
use std::arch::is_aarch64_feature_detected;
#[cfg(target_arch = "x86_64")]
use std::arch::is_x86_feature_detected;

/// Enumerates the CPU features relevant to QuicFuscate's optimizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFeature {
    AVX,
    AVX2,
    AVX512F,
    VAES,
    AESNI,
    PCLMULQDQ,
    NEON,
}

/// Singleton for accessing detected CPU features. Detection runs once, the
/// first time `instance()` is called.
pub struct FeatureDetector {
    features: HashMap<CpuFeature, bool>,
}

static INIT: Once = Once::new();
static mut DETECTOR: Option<FeatureDetector> = None;

impl FeatureDetector {
    pub fn instance() -> &'static Self {
        INIT.call_once(|| {
            let mut features = HashMap::new();

            #[cfg(target_arch = "x86_64")]
            {
                features.insert(CpuFeature::AVX, is_x86_feature_detected!("avx"));
                features.insert(CpuFeature::AVX2, is_x86_feature_detected!("avx2"));
                features.insert(CpuFeature::AVX512F, is_x86_feature_detected!("avx512f"));
                features.insert(CpuFeature::VAES, is_x86_feature_detected!("vaes"));
                features.insert(CpuFeature::AESNI, is_x86_feature_detected!("aes"));
                features.insert(CpuFeature::PCLMULQDQ, is_x86_feature_detected!("pclmulqdq"));
            }
            #[cfg(target_arch = "aarch64")]
            {
                features.insert(CpuFeature::NEON, is_aarch64_feature_detected!("neon"));
            }

            // Safety: `Once::call_once` guarantees this runs exactly once
            // before any `instance()` call observes `DETECTOR`.
            unsafe {
                DETECTOR = Some(FeatureDetector { features });
            }
        });
        unsafe { DETECTOR.as_ref().unwrap() }
    }

    pub fn has_feature(&self, feature: CpuFeature) -> bool {
        *self.features.get(&feature).unwrap_or(&false)
    }
}

/// Execution policy marker for runtime-dispatched SIMD code paths.
pub trait SimdPolicy: Any {
    fn as_any(&self) -> &dyn Any;
}

macro_rules! policy_marker {
    ($name:ident) => {
        pub struct $name;
        impl SimdPolicy for $name {
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

policy_marker!(Avx512);
policy_marker!(Avx2);
policy_marker!(Pclmulqdq);
policy_marker!(Neon);
policy_marker!(Scalar);

/// Dispatches to the best available SIMD implementation at runtime, ordered
/// most to least performant.
pub fn dispatch<F, R>(f: F) -> R
where
    F: Fn(&dyn SimdPolicy) -> R,
{
    let detector = FeatureDetector::instance();
    if detector.has_feature(CpuFeature::AVX512F) {
        f(&Avx512)
    } else if detector.has_feature(CpuFeature::AVX2) {
        f(&Avx2)
    } else if detector.has_feature(CpuFeature::PCLMULQDQ) {
        f(&Pclmulqdq)
    } else if detector.has_feature(CpuFeature::NEON) {
        f(&Neon)
    } else {
        f(&Scalar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_is_idempotent() {
        let a = FeatureDetector::instance() as *const _;
        let b = FeatureDetector::instance() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn dispatch_always_resolves_to_some_policy() {
        let hit = dispatch(|_policy| true);
        assert!(hit);
    }
}

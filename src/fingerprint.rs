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

//! # Fingerprint Module
//!
//! A fingerprint profile is a parameter record applied to the outgoing TLS
//! ClientHello by the `TlsEngine` collaborator before handshake bytes reach
//! the wire. This module owns profile selection and rotation; it never
//! touches TLS library internals directly (spec Open Question 4: the
//! TLS/QUIC engine boundary is an external collaborator, addressed only
//! through the `TlsEngine` trait in `connection`).

use clap::ValueEnum;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum BrowserProfile {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum OsProfile {
    Windows,
    MacOs,
    Linux,
    Ios,
    Android,
}

/// Ordered cipher suites, extensions (with GREASE interleave positions),
/// supported groups, signature algorithms, ALPN list, version bounds and
/// early-data/PSK support, plus cosmetic headers applied by the masquerading
/// pipeline (C8).
#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    pub browser: BrowserProfile,
    pub os: OsProfile,
    pub user_agent: String,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub grease_positions: Vec<usize>,
    pub supported_groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub alpn: Vec<&'static str>,
    pub tls_version_min: u16,
    pub tls_version_max: u16,
    pub early_data: bool,
    pub psk_modes: Vec<u8>,
    pub accept_language: String,
}

const GREASE_VALUES: [u16; 2] = [0x0a0a, 0x1a1a];

impl FingerprintProfile {
    pub fn new(browser: BrowserProfile, os: OsProfile) -> Self {
        let (user_agent, accept_language) = user_agent_for(browser, os);
        match browser {
            BrowserProfile::Chrome | BrowserProfile::Edge => Self {
                browser,
                os,
                user_agent,
                cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014],
                extensions: vec![0x0000, 0x0017, 0x0023, 0x0010, 0x000d, 0x0033, 0x002b, 0x002d, 0x000a, 0x0015, 0x0005],
                grease_positions: vec![0, 3],
                supported_groups: vec![0x001d, 0x0017, 0x0018],
                signature_algorithms: vec![0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501],
                alpn: vec!["h3"],
                tls_version_min: 0x0303,
                tls_version_max: 0x0304,
                early_data: true,
                psk_modes: vec![0x01],
                accept_language,
            },
            BrowserProfile::Firefox => Self {
                browser,
                os,
                user_agent,
                cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xcca9, 0xcca8, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xc013, 0xc014],
                extensions: vec![0x0000, 0x0017, 0x0023, 0x000d, 0x002b, 0x002d, 0x000a, 0x0005, 0x0010],
                grease_positions: vec![],
                supported_groups: vec![0x001d, 0x0017, 0x0018, 0x0019],
                signature_algorithms: vec![0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806],
                alpn: vec!["h3"],
                tls_version_min: 0x0303,
                tls_version_max: 0x0304,
                early_data: true,
                psk_modes: vec![0x01],
                accept_language,
            },
            BrowserProfile::Safari => Self {
                browser,
                os,
                user_agent,
                cipher_suites: vec![0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xc009, 0xc013, 0xc00a, 0xc014],
                extensions: vec![0x0000, 0x0017, 0x0023, 0x000d, 0x002b, 0x000a, 0x0010],
                grease_positions: vec![],
                supported_groups: vec![0x001d, 0x0017, 0x0018],
                signature_algorithms: vec![0x0403, 0x0804, 0x0401],
                alpn: vec!["h3"],
                tls_version_min: 0x0303,
                tls_version_max: 0x0304,
                early_data: false,
                psk_modes: vec![],
                accept_language,
            },
        }
    }

    /// Interleaves GREASE extension values at this profile's configured
    /// positions, producing the extension list as it would appear on the wire.
    pub fn extensions_with_grease(&self) -> Vec<u16> {
        let mut out = self.extensions.clone();
        for (i, &pos) in self.grease_positions.iter().enumerate() {
            let value = GREASE_VALUES[i % GREASE_VALUES.len()];
            let pos = pos.min(out.len());
            out.insert(pos, value);
        }
        out
    }

    /// Cosmetic HTTP headers used by the masquerading pipeline (C8) for
    /// synthesized HEADERS frames.
    pub fn cosmetic_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string()),
            ("accept-language", self.accept_language.clone()),
            ("accept-encoding", "gzip, deflate, br".to_string()),
        ]
    }
}

fn user_agent_for(browser: BrowserProfile, os: OsProfile) -> (String, String) {
    let os_token = match os {
        OsProfile::Windows => "Windows NT 10.0; Win64; x64",
        OsProfile::MacOs => "Macintosh; Intel Mac OS X 13_6",
        OsProfile::Linux => "X11; Linux x86_64",
        OsProfile::Ios => "iPhone; CPU iPhone OS 17_5 like Mac OS X",
        OsProfile::Android => "Linux; Android 14; Pixel 8",
    };
    let ua = match browser {
        BrowserProfile::Chrome => format!("Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36", os_token),
        BrowserProfile::Edge => format!("Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0", os_token),
        BrowserProfile::Firefox => format!("Mozilla/5.0 ({}; rv:127.0) Gecko/20100101 Firefox/127.0", os_token),
        BrowserProfile::Safari => format!("Mozilla/5.0 ({}) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15", os_token),
    };
    let lang = if browser == BrowserProfile::Firefox { "en-US,en;q=0.5" } else { "en-US,en;q=0.9" };
    (ua, lang.to_string())
}

/// Rotation strategy for cycling fingerprints between connections. Rotation
/// never applies mid-handshake — only `next_profile` for a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    Sequential,
    Random,
    TimeBased(Duration),
    ConnectionBased,
}

pub struct FingerprintRotator {
    pool: Vec<(BrowserProfile, OsProfile)>,
    strategy: RotationStrategy,
    cursor: AtomicUsize,
    connection_counter: AtomicU64,
    epoch: std::time::Instant,
}

impl FingerprintRotator {
    pub fn new(pool: Vec<(BrowserProfile, OsProfile)>, strategy: RotationStrategy) -> Self {
        Self {
            pool,
            strategy,
            cursor: AtomicUsize::new(0),
            connection_counter: AtomicU64::new(0),
            epoch: std::time::Instant::now(),
        }
    }

    /// Selects the profile for the next connection.
    pub fn next_profile(&self) -> FingerprintProfile {
        let (browser, os) = match self.strategy {
            RotationStrategy::Sequential | RotationStrategy::ConnectionBased => {
                let i = self.cursor.fetch_add(1, Ordering::SeqCst) % self.pool.len();
                self.pool[i]
            }
            RotationStrategy::Random => {
                use rand::Rng;
                let i = rand::thread_rng().gen_range(0..self.pool.len());
                self.pool[i]
            }
            RotationStrategy::TimeBased(interval) => {
                let elapsed = self.epoch.elapsed().as_secs();
                let slot = (elapsed / interval.as_secs().max(1)) as usize % self.pool.len();
                self.pool[slot]
            }
        };
        self.connection_counter.fetch_add(1, Ordering::Relaxed);
        FingerprintProfile::new(browser, os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_profile_interleaves_grease() {
        let profile = FingerprintProfile::new(BrowserProfile::Chrome, OsProfile::Windows);
        let with_grease = profile.extensions_with_grease();
        assert_eq!(with_grease.len(), profile.extensions.len() + profile.grease_positions.len());
        assert!(with_grease.contains(&0x0a0a));
    }

    #[test]
    fn firefox_profile_has_no_grease() {
        let profile = FingerprintProfile::new(BrowserProfile::Firefox, OsProfile::Linux);
        assert_eq!(profile.extensions_with_grease(), profile.extensions);
    }

    #[test]
    fn sequential_rotation_cycles_through_pool() {
        let pool = vec![
            (BrowserProfile::Chrome, OsProfile::Windows),
            (BrowserProfile::Firefox, OsProfile::Linux),
        ];
        let rotator = FingerprintRotator::new(pool, RotationStrategy::Sequential);
        let first = rotator.next_profile();
        let second = rotator.next_profile();
        let third = rotator.next_profile();
        assert_eq!(first.browser, BrowserProfile::Chrome);
        assert_eq!(second.browser, BrowserProfile::Firefox);
        assert_eq!(third.browser, BrowserProfile::Chrome);
    }
}

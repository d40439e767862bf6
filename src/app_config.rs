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

//! # Application Configuration
//!
//! Parses the unified TOML configuration covering every tunable subsystem:
//! FEC, TLS fingerprint rotation, SNI concealment, spin-bit strategy,
//! masquerading, path MTU discovery, and connection migration.

use crate::fec::FecConfig;
use crate::fingerprint::{BrowserProfile, OsProfile, RotationStrategy};
use crate::error::{ConfigError, QuicFuscateError, Result};
use crate::spin_bit::SpinBitStrategy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const RFC_8899_MIN_MTU: u16 = 576;
const MAX_MTU_CEILING: u16 = 9000;

#[derive(Clone, Debug)]
pub struct FingerprintConfig {
    pub pool: Vec<(BrowserProfile, OsProfile)>,
    pub strategy: RotationStrategy,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            pool: vec![(BrowserProfile::Chrome, OsProfile::Windows)],
            strategy: RotationStrategy::ConnectionBased,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SniConfig {
    pub enabled: bool,
    pub doh_provider: Option<String>,
    pub pad_to: Option<usize>,
    pub front_host: Option<String>,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self { enabled: true, doh_provider: None, pad_to: None, front_host: None }
    }
}

#[derive(Clone, Debug)]
pub struct MtuConfig {
    pub enabled: bool,
    pub min_mtu: u16,
    pub max_mtu: u16,
    pub step_size: u16,
    pub blackhole_threshold: u8,
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self { enabled: true, min_mtu: 1200, max_mtu: 1500, step_size: 10, blackhole_threshold: 3 }
    }
}

impl MtuConfig {
    fn validate(&self) -> Result<()> {
        if self.min_mtu < RFC_8899_MIN_MTU || self.max_mtu > MAX_MTU_CEILING || self.step_size == 0 || self.min_mtu >= self.max_mtu {
            return Err(QuicFuscateError::Config(ConfigError::OutOfRange(
                "mtu bounds must satisfy 576 <= min < max <= 9000 with step >= 1".into(),
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    pub preferred_interface: Option<String>,
    pub path_challenge_timeout: Duration,
    pub max_attempts: u8,
    pub cooldown: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            preferred_interface: None,
            path_challenge_timeout: Duration::from_millis(500),
            max_attempts: 5,
            cooldown: Duration::from_secs(1),
        }
    }
}

impl MigrationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(QuicFuscateError::Config(ConfigError::OutOfRange(
                "migration.max_attempts must be at least 1".into(),
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MasqueradeConfig {
    pub dynamic_table_capacity: usize,
}

impl Default for MasqueradeConfig {
    fn default() -> Self {
        Self { dynamic_table_capacity: 4096 }
    }
}

#[derive(Clone, Debug)]
pub struct SpinBitConfig {
    pub strategy: SpinBitStrategy,
}

impl Default for SpinBitConfig {
    fn default() -> Self {
        Self { strategy: SpinBitStrategy::TimingBased }
    }
}

/// Unified configuration parsed from a TOML file, covering every tunable
/// subsystem in the connection core.
#[derive(Clone)]
pub struct AppConfig {
    pub fec: FecConfig,
    pub fingerprint: FingerprintConfig,
    pub sni: SniConfig,
    pub spin_bit: SpinBitConfig,
    pub mtu: MtuConfig,
    pub migration: MigrationConfig,
    pub masquerade: MasqueradeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fec: FecConfig::default(),
            fingerprint: FingerprintConfig::default(),
            sni: SniConfig::default(),
            spin_bit: SpinBitConfig::default(),
            mtu: MtuConfig::default(),
            migration: MigrationConfig::default(),
            masquerade: MasqueradeConfig::default(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawTable {
    sni: Option<RawSni>,
    spin_bit: Option<RawSpinBit>,
    mtu: Option<RawMtu>,
    migration: Option<RawMigration>,
    masquerade: Option<RawMasquerade>,
}

#[derive(Deserialize)]
struct RawSni {
    enabled: Option<bool>,
    doh_provider: Option<String>,
    pad_to: Option<usize>,
    front_host: Option<String>,
}

#[derive(Deserialize)]
struct RawSpinBit {
    strategy: Option<String>,
}

#[derive(Deserialize)]
struct RawMtu {
    min_mtu: Option<u16>,
    max_mtu: Option<u16>,
    step_size: Option<u16>,
    blackhole_threshold: Option<u8>,
    enabled: Option<bool>,
}

#[derive(Deserialize)]
struct RawMigration {
    preferred_interface: Option<String>,
    path_challenge_timeout_ms: Option<u64>,
    max_attempts: Option<u8>,
    cooldown_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RawMasquerade {
    dynamic_table_capacity: Option<usize>,
}

fn parse_spin_bit(s: &str) -> SpinBitStrategy {
    match s {
        "random" => SpinBitStrategy::Random { flip_probability_percent: 50 },
        "zero" => SpinBitStrategy::ConstantZero,
        "one" => SpinBitStrategy::ConstantOne,
        "mimicry" => SpinBitStrategy::Mimicry,
        _ => SpinBitStrategy::TimingBased,
    }
}

impl AppConfig {
    /// Parses a TOML document; every table and field is optional and falls
    /// back to its default, mirroring `FecConfig::from_toml`'s leniency.
    pub fn from_toml(s: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(s)
            .map_err(|e| QuicFuscateError::Config(ConfigError::InvalidArgument(e.to_string())))?;

        let fec = FecConfig::from_toml(s).unwrap_or_default();

        let mut sni = SniConfig::default();
        if let Some(r) = raw.sni {
            sni.enabled = r.enabled.unwrap_or(sni.enabled);
            sni.doh_provider = r.doh_provider;
            sni.pad_to = r.pad_to;
            sni.front_host = r.front_host;
        }

        let mut spin_bit = SpinBitConfig::default();
        if let Some(r) = raw.spin_bit {
            if let Some(strategy) = r.strategy {
                spin_bit.strategy = parse_spin_bit(&strategy);
            }
        }

        let mut mtu = MtuConfig::default();
        if let Some(r) = raw.mtu {
            mtu.min_mtu = r.min_mtu.unwrap_or(mtu.min_mtu);
            mtu.max_mtu = r.max_mtu.unwrap_or(mtu.max_mtu);
            mtu.step_size = r.step_size.unwrap_or(mtu.step_size);
            mtu.blackhole_threshold = r.blackhole_threshold.unwrap_or(mtu.blackhole_threshold);
            mtu.enabled = r.enabled.unwrap_or(mtu.enabled);
        }

        let mut migration = MigrationConfig::default();
        if let Some(r) = raw.migration {
            migration.preferred_interface = r.preferred_interface;
            if let Some(ms) = r.path_challenge_timeout_ms {
                migration.path_challenge_timeout = Duration::from_millis(ms);
            }
            migration.max_attempts = r.max_attempts.unwrap_or(migration.max_attempts);
            if let Some(ms) = r.cooldown_ms {
                migration.cooldown = Duration::from_millis(ms);
            }
        }

        let mut masquerade = MasqueradeConfig::default();
        if let Some(r) = raw.masquerade {
            masquerade.dynamic_table_capacity = r.dynamic_table_capacity.unwrap_or(masquerade.dynamic_table_capacity);
        }

        Ok(Self {
            fec,
            fingerprint: FingerprintConfig::default(),
            sni,
            spin_bit,
            mtu,
            migration,
            masquerade,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QuicFuscateError::Config(ConfigError::InvalidArgument(e.to_string())))?;
        Self::from_toml(&contents)
    }

    /// Validates every sub-configuration's bounds.
    pub fn validate(&self) -> Result<()> {
        self.mtu.validate()?;
        self.migration.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_toml_falls_back_to_defaults() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg.mtu.min_mtu, 1200);
        assert_eq!(cfg.migration.max_attempts, 5);
    }

    #[test]
    fn mtu_table_overrides_defaults() {
        let toml = r#"
            [mtu]
            min_mtu = 1300
            max_mtu = 1400
            step_size = 20
        "#;
        let cfg = AppConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.mtu.min_mtu, 1300);
        assert_eq!(cfg.mtu.max_mtu, 1400);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_mtu_bounds_fail_validation() {
        let toml = r#"
            [mtu]
            min_mtu = 1500
            max_mtu = 1200
        "#;
        let cfg = AppConfig::from_toml(toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spin_bit_strategy_parses_from_string() {
        let toml = r#"
            [spin_bit]
            strategy = "random"
        "#;
        let cfg = AppConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.spin_bit.strategy, SpinBitStrategy::Random { flip_probability_percent: 50 });
    }
}

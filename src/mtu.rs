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

//! # Path MTU Manager
//!
//! Bidirectional path MTU discovery. Two independent state records (outgoing,
//! incoming) each binary-search probe inside `[min_mtu, max_mtu]`, detect
//! blackholes, and track stability once validated.

use crate::error::{ConfigError, QuicFuscateError, Result};
use std::time::{Duration, Instant};

const RFC_8899_MIN_MTU: u16 = 576;
const MAX_MTU_CEILING: u16 = 9000;
const DEFAULT_ADAPTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PERIODIC_PROBE_INTERVAL: Duration = Duration::from_secs(60);
const STABILITY_WINDOW: Duration = Duration::from_secs(60);
const STABILITY_CHANGE_THRESHOLD: usize = 3;
const HIGH_LOSS_THRESHOLD: f32 = 0.05;
const LOW_LOSS_THRESHOLD: f32 = 0.01;
const GOOD_RTT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuStatus {
    Unknown,
    Searching,
    Validated,
    Blackhole,
    Unstable,
}

#[derive(Debug, Clone, Copy)]
struct MtuChange {
    old_mtu: u16,
    new_mtu: u16,
    at: Instant,
}

struct PathMtuState {
    current_mtu: u16,
    last_successful_mtu: u16,
    current_probe_mtu: u16,
    min_mtu: u16,
    max_mtu: u16,
    step_size: u16,
    in_search_phase: bool,
    status: MtuStatus,
    consecutive_failures: u8,
    last_probe_at: Option<Instant>,
    last_adaptive_check: Option<Instant>,
    recent_changes: Vec<MtuChange>,
}

impl PathMtuState {
    fn new(min_mtu: u16, max_mtu: u16, step_size: u16) -> Self {
        Self {
            current_mtu: min_mtu,
            last_successful_mtu: min_mtu,
            current_probe_mtu: min_mtu,
            min_mtu,
            max_mtu,
            step_size,
            in_search_phase: false,
            status: MtuStatus::Unknown,
            consecutive_failures: 0,
            last_probe_at: None,
            last_adaptive_check: None,
            recent_changes: Vec::new(),
        }
    }

    fn record_change(&mut self, new_mtu: u16, now: Instant) {
        if new_mtu == self.current_mtu {
            return;
        }
        self.recent_changes.push(MtuChange { old_mtu: self.current_mtu, new_mtu, at: now });
        self.recent_changes.retain(|c| now.saturating_duration_since(c.at) <= STABILITY_WINDOW);
        self.current_mtu = new_mtu;
    }

    fn is_unstable(&self, now: Instant) -> bool {
        self.recent_changes.iter().filter(|c| now.saturating_duration_since(c.at) <= STABILITY_WINDOW).count()
            > STABILITY_CHANGE_THRESHOLD
    }
}

/// Manages path MTU discovery for both traffic directions independently
/// (spec §4.10). `min ≤ last_successful ≤ current ≤ max` holds after every
/// event.
pub struct PathMtuManager {
    enabled: bool,
    blackhole_threshold: u8,
    outgoing: PathMtuState,
    incoming: PathMtuState,
}

impl PathMtuManager {
    pub fn new(min_mtu: u16, max_mtu: u16, step_size: u16, blackhole_threshold: u8) -> Result<Self> {
        if min_mtu < RFC_8899_MIN_MTU || max_mtu > MAX_MTU_CEILING || step_size == 0 || min_mtu >= max_mtu {
            return Err(QuicFuscateError::Config(ConfigError::OutOfRange(
                "mtu bounds must satisfy 576 <= min < max <= 9000 with step >= 1".into(),
            )));
        }
        Ok(Self {
            enabled: false,
            blackhole_threshold,
            outgoing: PathMtuState::new(min_mtu, max_mtu, step_size),
            incoming: PathMtuState::new(min_mtu, max_mtu, step_size),
        })
    }

    fn state(&self, dir: Direction) -> &PathMtuState {
        match dir {
            Direction::Outgoing => &self.outgoing,
            Direction::Incoming => &self.incoming,
        }
    }

    fn state_mut(&mut self, dir: Direction) -> &mut PathMtuState {
        match dir {
            Direction::Outgoing => &mut self.outgoing,
            Direction::Incoming => &mut self.incoming,
        }
    }

    pub fn enable(&mut self, now: Instant) {
        self.enabled = true;
        self.begin_discovery(Direction::Outgoing, now);
        self.begin_discovery(Direction::Incoming, now);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn begin_discovery(&mut self, dir: Direction, now: Instant) {
        let s = self.state_mut(dir);
        s.current_probe_mtu = (s.min_mtu + s.step_size).min(s.max_mtu);
        s.last_successful_mtu = s.min_mtu;
        s.in_search_phase = true;
        s.status = MtuStatus::Searching;
        s.last_probe_at = Some(now);
    }

    pub fn current_mtu(&self, dir: Direction) -> u16 {
        self.state(dir).current_mtu
    }

    pub fn last_successful_mtu(&self, dir: Direction) -> u16 {
        self.state(dir).last_successful_mtu
    }

    pub fn status(&self, dir: Direction) -> MtuStatus {
        self.state(dir).status
    }

    pub fn pending_probe_size(&self, dir: Direction) -> Option<u16> {
        let s = self.state(dir);
        if s.in_search_phase {
            Some(s.current_probe_mtu)
        } else {
            None
        }
    }

    /// Sets the MTU directly, bypassing discovery. Fails `OUT_OF_RANGE` if
    /// outside `[min, max]` for that direction.
    pub fn set_mtu_size(&mut self, mtu: u16, apply_both: bool, now: Instant) -> Result<()> {
        if mtu < self.outgoing.min_mtu || mtu > self.outgoing.max_mtu {
            return Err(QuicFuscateError::Config(ConfigError::OutOfRange(format!(
                "mtu {} outside configured bounds",
                mtu
            ))));
        }
        self.outgoing.last_successful_mtu = mtu;
        self.outgoing.record_change(mtu, now);
        self.outgoing.status = MtuStatus::Validated;
        self.outgoing.in_search_phase = false;
        if apply_both {
            self.incoming.last_successful_mtu = mtu;
            self.incoming.record_change(mtu, now);
            self.incoming.status = MtuStatus::Validated;
            self.incoming.in_search_phase = false;
        }
        Ok(())
    }

    /// Feeds a probe ack/timeout back into the discovery state machine for
    /// `dir`. Returns `NOT_ENABLED` if discovery was never started.
    pub fn handle_probe_response(&mut self, dir: Direction, success: bool, now: Instant) -> Result<()> {
        if !self.enabled {
            return Err(QuicFuscateError::Config(ConfigError::InvalidArgument(
                "mtu discovery not enabled".into(),
            )));
        }
        let threshold = self.blackhole_threshold;
        let s = self.state_mut(dir);
        if !s.in_search_phase {
            return Ok(());
        }
        s.last_probe_at = Some(now);
        let probe = s.current_probe_mtu;

        if success {
            s.consecutive_failures = 0;
            s.last_successful_mtu = probe;
            s.record_change(probe, now);
            if probe >= s.max_mtu {
                s.in_search_phase = false;
                s.status = MtuStatus::Validated;
            } else {
                s.current_probe_mtu = (probe + s.step_size).min(s.max_mtu);
            }
        } else {
            s.consecutive_failures += 1;
            if s.consecutive_failures >= threshold {
                let last_good = s.last_successful_mtu;
                s.record_change(last_good, now);
                s.in_search_phase = false;
                s.status = MtuStatus::Blackhole;
            } else {
                let last_good = s.last_successful_mtu;
                let next_probe = last_good + (probe - last_good) / 2;
                if next_probe <= last_good {
                    s.record_change(last_good, now);
                    s.in_search_phase = false;
                    s.status = MtuStatus::Validated;
                } else {
                    s.current_probe_mtu = next_probe;
                }
            }
        }
        if s.is_unstable(now) {
            s.status = MtuStatus::Unstable;
        }
        Ok(())
    }

    /// Consumes a loss/RTT sample on the adaptive-check cadence (spec
    /// §4.10): high loss triggers a one-step decrease, good conditions probe
    /// upward. No-op if called before `adaptive_check_interval` has elapsed.
    pub fn adapt_dynamically(&mut self, dir: Direction, loss_rate: f32, rtt_ms: u32, now: Instant) {
        let s = self.state_mut(dir);
        if let Some(last) = s.last_adaptive_check {
            if now.saturating_duration_since(last) < DEFAULT_ADAPTIVE_CHECK_INTERVAL {
                return;
            }
        }
        s.last_adaptive_check = Some(now);
        if s.status != MtuStatus::Validated {
            return;
        }
        if loss_rate > HIGH_LOSS_THRESHOLD {
            let decreased = s.current_mtu.saturating_sub(s.step_size).max(s.min_mtu);
            s.record_change(decreased, now);
            s.last_successful_mtu = decreased;
        } else if loss_rate < LOW_LOSS_THRESHOLD && rtt_ms < GOOD_RTT_MS && s.current_mtu < s.max_mtu {
            s.current_probe_mtu = (s.current_mtu + s.step_size).min(s.max_mtu);
            s.in_search_phase = true;
            s.status = MtuStatus::Searching;
        }
    }

    /// Periodic re-probe once validated: probes `current` and, if below max,
    /// `current + step` every `periodic_probe_interval` (spec §4.10).
    pub fn tick_periodic(&mut self, dir: Direction, now: Instant) -> Option<u16> {
        let s = self.state_mut(dir);
        if s.status != MtuStatus::Validated {
            return None;
        }
        let due = s
            .last_probe_at
            .map(|last| now.saturating_duration_since(last) >= DEFAULT_PERIODIC_PROBE_INTERVAL)
            .unwrap_or(true);
        if !due {
            return None;
        }
        s.last_probe_at = Some(now);
        if s.current_mtu < s.max_mtu {
            let probe = (s.current_mtu + s.step_size).min(s.max_mtu);
            s.current_probe_mtu = probe;
            s.in_search_phase = true;
            s.status = MtuStatus::Searching;
            Some(probe)
        } else {
            Some(s.current_mtu)
        }
    }

    pub fn is_unstable(&self, dir: Direction) -> bool {
        matches!(self.state(dir).status, MtuStatus::Unstable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_construction_bounds() {
        assert!(PathMtuManager::new(400, 1500, 10, 3).is_err());
        assert!(PathMtuManager::new(1200, 1500, 0, 3).is_err());
        assert!(PathMtuManager::new(1500, 1200, 10, 3).is_err());
    }

    #[test]
    fn binary_search_detects_blackhole_and_reverts() {
        let mut mgr = PathMtuManager::new(1200, 1500, 10, 3).unwrap();
        let mut now = Instant::now();
        mgr.enable(now);

        for _ in 0..3 {
            now += Duration::from_millis(1);
            mgr.handle_probe_response(Direction::Outgoing, true, now).unwrap();
        }
        assert_eq!(mgr.last_successful_mtu(Direction::Outgoing), 1230);

        for _ in 0..3 {
            now += Duration::from_millis(1);
            mgr.handle_probe_response(Direction::Outgoing, false, now).unwrap();
        }

        assert_eq!(mgr.status(Direction::Outgoing), MtuStatus::Blackhole);
        assert_eq!(mgr.current_mtu(Direction::Outgoing), 1230);
        assert_eq!(mgr.last_successful_mtu(Direction::Outgoing), 1230);
    }

    #[test]
    fn all_probes_succeeding_converges_to_validated_at_max() {
        let mut mgr = PathMtuManager::new(1200, 1500, 10, 3).unwrap();
        let mut now = Instant::now();
        mgr.enable(now);
        for _ in 0..30 {
            now += Duration::from_millis(1);
            if mgr.status(Direction::Outgoing) == MtuStatus::Validated {
                break;
            }
            mgr.handle_probe_response(Direction::Outgoing, true, now).unwrap();
        }
        assert_eq!(mgr.status(Direction::Outgoing), MtuStatus::Validated);
        assert_eq!(mgr.current_mtu(Direction::Outgoing), 1500);
    }

    #[test]
    fn directions_are_independent() {
        let mut mgr = PathMtuManager::new(1200, 1500, 10, 3).unwrap();
        let mut now = Instant::now();
        mgr.enable(now);
        now += Duration::from_millis(1);
        mgr.handle_probe_response(Direction::Outgoing, true, now).unwrap();
        assert_eq!(mgr.last_successful_mtu(Direction::Outgoing), 1210);
        assert_eq!(mgr.last_successful_mtu(Direction::Incoming), 1200);
    }

    #[test]
    fn more_than_three_changes_per_minute_marks_unstable() {
        let mut mgr = PathMtuManager::new(1200, 1500, 10, 3).unwrap();
        let mut now = Instant::now();
        mgr.enable(now);
        for _ in 0..5 {
            now += Duration::from_millis(1);
            mgr.handle_probe_response(Direction::Outgoing, true, now).unwrap();
        }
        assert_eq!(mgr.status(Direction::Outgoing), MtuStatus::Unstable);
    }
}

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

//! # Migration Controller
//!
//! Drives connection migration across network interfaces: enumerate
//! candidates, open a second socket, validate the new path with
//! PATH_CHALLENGE/PATH_RESPONSE, and swap the active endpoint on success.
//! The actual socket I/O is supplied by the connection core through
//! [`PathValidator`] so this module stays testable without a live network.

use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const DEFAULT_PATH_CHALLENGE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_MAX_MIGRATION_ATTEMPTS: u8 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub local_addr: SocketAddr,
}

/// Sends a PATH_CHALLENGE on a candidate interface and reports whether a
/// matching PATH_RESPONSE arrived before the timeout. Implemented by the
/// connection core against the real socket; mocked in tests.
pub trait PathValidator {
    fn enumerate_interfaces(&self) -> Vec<NetworkInterface>;
    fn send_path_challenge(&mut self, iface: &NetworkInterface, data: u64) -> std::io::Result<()>;
    /// Polls for a PATH_RESPONSE matching `data` on `iface`. Non-blocking;
    /// the caller re-polls until the deadline elapses.
    fn poll_path_response(&mut self, iface: &NetworkInterface, data: u64) -> bool;
    fn new_connection_id(&mut self) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Validated,
    TimedOut,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct MigrationAttempt {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub success: bool,
}

pub struct MigrationController {
    path_challenge_timeout: Duration,
    max_attempts: u8,
    cooldown: Duration,
    preferred_interface: Option<String>,
    active_endpoint: SocketAddr,
    history: Vec<SocketAddr>,
    last_attempt_at: Option<Instant>,
    attempts: Vec<MigrationAttempt>,
}

impl MigrationController {
    pub fn new(initial_endpoint: SocketAddr) -> Self {
        Self {
            path_challenge_timeout: DEFAULT_PATH_CHALLENGE_TIMEOUT,
            max_attempts: DEFAULT_MAX_MIGRATION_ATTEMPTS,
            cooldown: DEFAULT_COOLDOWN,
            preferred_interface: None,
            active_endpoint: initial_endpoint,
            history: Vec::new(),
            last_attempt_at: None,
            attempts: Vec::new(),
        }
    }

    pub fn set_preferred_interface(&mut self, name: Option<String>) {
        self.preferred_interface = name;
    }

    pub fn set_path_challenge_timeout(&mut self, timeout: Duration) {
        self.path_challenge_timeout = timeout;
    }

    pub fn set_max_attempts(&mut self, attempts: u8) {
        self.max_attempts = attempts;
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn active_endpoint(&self) -> SocketAddr {
        self.active_endpoint
    }

    pub fn history(&self) -> &[SocketAddr] {
        &self.history
    }

    pub fn attempts(&self) -> &[MigrationAttempt] {
        &self.attempts
    }

    fn select_candidate<'a>(&self, interfaces: &'a [NetworkInterface]) -> Option<&'a NetworkInterface> {
        if let Some(preferred) = &self.preferred_interface {
            if let Some(found) = interfaces.iter().find(|i| &i.name == preferred) {
                return Some(found);
            }
        }
        interfaces.iter().find(|i| i.local_addr != self.active_endpoint)
    }

    /// Runs one full migration sequence against `validator`'s interfaces,
    /// polling `poll_path_response` at `poll_interval` up to the configured
    /// timeout, retrying up to `max_attempts` times with `cooldown` between.
    /// `sleep` abstracts the wait primitive so this stays synchronous and
    /// deterministic in tests; the connection core passes a real sleeper.
    pub fn migrate<V: PathValidator>(
        &mut self,
        validator: &mut V,
        now: &mut Instant,
        mut advance: impl FnMut(&mut Instant, Duration),
        poll_interval: Duration,
        on_attempt: &mut dyn FnMut(bool, SocketAddr, SocketAddr),
    ) -> MigrationOutcome {
        let interfaces = validator.enumerate_interfaces();
        let candidate = match self.select_candidate(&interfaces) {
            Some(c) => c.clone(),
            None => return MigrationOutcome::Exhausted,
        };

        for attempt_no in 0..self.max_attempts {
            if attempt_no > 0 {
                advance(now, self.cooldown);
            }
            let challenge_data = rand::thread_rng().next_u64();
            if validator.send_path_challenge(&candidate, challenge_data).is_err() {
                self.attempts.push(MigrationAttempt { from: self.active_endpoint, to: candidate.local_addr, success: false });
                on_attempt(false, self.active_endpoint, candidate.local_addr);
                continue;
            }

            let deadline_budget = self.path_challenge_timeout;
            let mut waited = Duration::ZERO;
            let mut responded = false;
            while waited < deadline_budget {
                if validator.poll_path_response(&candidate, challenge_data) {
                    responded = true;
                    break;
                }
                advance(now, poll_interval);
                waited += poll_interval;
            }

            self.last_attempt_at = Some(*now);
            self.attempts.push(MigrationAttempt { from: self.active_endpoint, to: candidate.local_addr, success: responded });
            on_attempt(responded, self.active_endpoint, candidate.local_addr);

            if responded {
                self.history.push(self.active_endpoint);
                self.active_endpoint = candidate.local_addr;
                let _ = validator.new_connection_id();
                return MigrationOutcome::Validated;
            }
        }
        MigrationOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockValidator {
        interfaces: Vec<NetworkInterface>,
        responses: HashMap<u64, bool>,
        cid_counter: u8,
    }

    impl PathValidator for MockValidator {
        fn enumerate_interfaces(&self) -> Vec<NetworkInterface> {
            self.interfaces.clone()
        }
        fn send_path_challenge(&mut self, _iface: &NetworkInterface, _data: u64) -> std::io::Result<()> {
            Ok(())
        }
        fn poll_path_response(&mut self, _iface: &NetworkInterface, data: u64) -> bool {
            self.responses.get(&data).copied().unwrap_or(true)
        }
        fn new_connection_id(&mut self) -> Vec<u8> {
            self.cid_counter += 1;
            vec![self.cid_counter]
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn successful_migration_swaps_endpoint_and_records_history() {
        let mut ctrl = MigrationController::new(addr(1));
        let mut validator = MockValidator {
            interfaces: vec![NetworkInterface { name: "eth1".into(), local_addr: addr(2) }],
            responses: HashMap::new(),
            cid_counter: 0,
        };
        let mut now = Instant::now();
        let mut attempts_seen = Vec::new();
        let outcome = ctrl.migrate(
            &mut validator,
            &mut now,
            |t, d| *t += d,
            Duration::from_millis(10),
            &mut |success, from, to| attempts_seen.push((success, from, to)),
        );
        assert_eq!(outcome, MigrationOutcome::Validated);
        assert_eq!(ctrl.active_endpoint(), addr(2));
        assert_eq!(ctrl.history(), &[addr(1)]);
        assert_eq!(attempts_seen, vec![(true, addr(1), addr(2))]);
    }

    #[test]
    fn exhausts_retries_on_persistent_failure() {
        let mut ctrl = MigrationController::new(addr(1));
        ctrl.set_max_attempts(2);
        let mut validator = MockValidator {
            interfaces: vec![NetworkInterface { name: "eth1".into(), local_addr: addr(2) }],
            responses: HashMap::new(),
            cid_counter: 0,
        };
        // force every poll to report "no response yet" by pre-seeding nothing
        // and instead returning false unconditionally via a custom poll.
        struct AlwaysFail(Vec<NetworkInterface>);
        impl PathValidator for AlwaysFail {
            fn enumerate_interfaces(&self) -> Vec<NetworkInterface> {
                self.0.clone()
            }
            fn send_path_challenge(&mut self, _iface: &NetworkInterface, _data: u64) -> std::io::Result<()> {
                Ok(())
            }
            fn poll_path_response(&mut self, _iface: &NetworkInterface, _data: u64) -> bool {
                false
            }
            fn new_connection_id(&mut self) -> Vec<u8> {
                vec![0]
            }
        }
        let _ = validator;
        let mut failing = AlwaysFail(vec![NetworkInterface { name: "eth1".into(), local_addr: addr(2) }]);
        let mut now = Instant::now();
        let outcome = ctrl.migrate(
            &mut failing,
            &mut now,
            |t, d| *t += d,
            Duration::from_millis(100),
            &mut |_, _, _| {},
        );
        assert_eq!(outcome, MigrationOutcome::TimedOut);
        assert_eq!(ctrl.active_endpoint(), addr(1));
        assert_eq!(ctrl.attempts().len(), 2);
    }

    #[test]
    fn no_candidate_interface_is_exhausted_immediately() {
        let mut ctrl = MigrationController::new(addr(1));
        let mut validator = MockValidator { interfaces: vec![], responses: HashMap::new(), cid_counter: 0 };
        let mut now = Instant::now();
        let outcome = ctrl.migrate(&mut validator, &mut now, |t, d| *t += d, Duration::from_millis(10), &mut |_, _, _| {});
        assert_eq!(outcome, MigrationOutcome::Exhausted);
    }

    #[test]
    fn preferred_interface_is_selected_when_available() {
        let mut ctrl = MigrationController::new(addr(1));
        ctrl.set_preferred_interface(Some("wlan0".into()));
        let mut validator = MockValidator {
            interfaces: vec![
                NetworkInterface { name: "eth1".into(), local_addr: addr(2) },
                NetworkInterface { name: "wlan0".into(), local_addr: addr(3) },
            ],
            responses: HashMap::new(),
            cid_counter: 0,
        };
        let mut now = Instant::now();
        ctrl.migrate(&mut validator, &mut now, |t, d| *t += d, Duration::from_millis(10), &mut |_, _, _| {});
        assert_eq!(ctrl.active_endpoint(), addr(3));
    }
}

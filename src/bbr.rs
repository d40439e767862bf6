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

//! # BBRv2 Congestion Controller
//!
//! A bandwidth- and RTT-estimation based congestion controller. Unlike loss
//! based controllers, cwnd and pacing rate are driven off the delivery rate
//! and min-RTT samples; packet loss bounds the inflight ceiling but never
//! directly shrinks cwnd.

const STARTUP_PACING_GAIN: f64 = 2.885;
const STARTUP_CWND_GAIN: f64 = 2.0;
const DRAIN_PACING_GAIN: f64 = 0.75;
const DRAIN_CWND_GAIN: f64 = 2.0;
const PROBE_BW_CWND_GAIN: f64 = 2.0;
const PROBE_BW_CYCLE: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const PROBE_RTT_CWND_MTU_MULTIPLE: u64 = 4;
const PROBE_RTT_DURATION_US: u64 = 200_000;
const PROBE_BW_MAX_IDLE_US: u64 = 10_000_000;
const STARTUP_FULL_BW_ROUNDS: u32 = 3;
const STARTUP_FULL_BW_THRESHOLD: f64 = 1.25;
const LOSS_ROUND_THRESHOLD: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrState {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// One `update` call's worth of ack-event telemetry, reported by the
/// connection core (spec §4.9) on every ack-eliciting batch processed.
#[derive(Debug, Clone, Copy)]
pub struct AckEvent {
    pub rtt_us: u64,
    pub delivered_bytes: u64,
    pub delivered_duration_us: u64,
    pub bytes_in_flight: u64,
    pub bytes_lost: u64,
    pub now_us: u64,
}

pub struct BbrController {
    state: BbrState,
    mtu: u64,
    max_bw_bps: f64,
    min_rtt_us: u64,
    min_rtt_stamp_us: u64,
    round_count: u32,
    full_bw_count: u32,
    full_bw_reference: f64,
    cycle_index: usize,
    cycle_stamp_us: u64,
    probe_rtt_stamp_us: Option<u64>,
    probe_rtt_done_us: Option<u64>,
    inflight_hi: u64,
    pacing_rate_bps: f64,
    cwnd_bytes: u64,
}

impl BbrController {
    pub fn new(mtu: u64) -> Self {
        Self {
            state: BbrState::Startup,
            mtu,
            max_bw_bps: 0.0,
            min_rtt_us: u64::MAX,
            min_rtt_stamp_us: 0,
            round_count: 0,
            full_bw_count: 0,
            full_bw_reference: 0.0,
            cycle_index: 0,
            cycle_stamp_us: 0,
            probe_rtt_stamp_us: None,
            probe_rtt_done_us: None,
            inflight_hi: u64::MAX,
            pacing_rate_bps: 0.0,
            cwnd_bytes: mtu.saturating_mul(STARTUP_CWND_GAIN as u64).max(mtu * 4),
        }
    }

    pub fn state(&self) -> BbrState {
        self.state
    }

    pub fn pacing_rate_bps(&self) -> f64 {
        self.pacing_rate_bps
    }

    pub fn cwnd_bytes(&self) -> u64 {
        self.cwnd_bytes
    }

    pub fn max_bandwidth_bps(&self) -> f64 {
        self.max_bw_bps
    }

    pub fn min_rtt_us(&self) -> u64 {
        self.min_rtt_us
    }

    /// Processes one ack event, advancing the state machine and recomputing
    /// pacing rate and cwnd. Called on every ack-eliciting batch (spec §4.9).
    pub fn update(&mut self, ev: AckEvent) {
        self.round_count += 1;
        self.update_min_rtt(ev);
        self.update_max_bandwidth(ev);
        self.update_inflight_hi(ev);

        match self.state {
            BbrState::Startup => self.tick_startup(),
            BbrState::Drain => self.tick_drain(ev),
            BbrState::ProbeBw => self.tick_probe_bw(ev),
            BbrState::ProbeRtt => self.tick_probe_rtt(ev),
        }

        self.recompute_pacing_and_cwnd(ev);
    }

    fn update_min_rtt(&mut self, ev: AckEvent) {
        if ev.rtt_us == 0 {
            return;
        }
        if ev.rtt_us < self.min_rtt_us || ev.now_us.saturating_sub(self.min_rtt_stamp_us) > PROBE_BW_MAX_IDLE_US {
            self.min_rtt_us = ev.rtt_us;
            self.min_rtt_stamp_us = ev.now_us;
        }
    }

    fn update_max_bandwidth(&mut self, ev: AckEvent) {
        if ev.delivered_duration_us == 0 {
            return;
        }
        let sample = ev.delivered_bytes as f64 * 1_000_000.0 / ev.delivered_duration_us as f64;
        if sample > self.max_bw_bps {
            self.max_bw_bps = sample;
        }
    }

    /// Loss never shrinks cwnd directly; it bounds the inflight ceiling used
    /// by PROBE_BW so the controller backs off bandwidth-driven growth.
    fn update_inflight_hi(&mut self, ev: AckEvent) {
        if ev.bytes_in_flight == 0 {
            return;
        }
        let loss_ratio = ev.bytes_lost as f64 / ev.bytes_in_flight as f64;
        if loss_ratio > LOSS_ROUND_THRESHOLD {
            self.inflight_hi = (ev.bytes_in_flight as f64 * (1.0 - loss_ratio)) as u64;
        }
    }

    fn tick_startup(&mut self) {
        if self.max_bw_bps > self.full_bw_reference * STARTUP_FULL_BW_THRESHOLD {
            self.full_bw_reference = self.max_bw_bps;
            self.full_bw_count = 0;
        } else {
            self.full_bw_count += 1;
        }
        if self.full_bw_count >= STARTUP_FULL_BW_ROUNDS {
            self.state = BbrState::Drain;
        }
    }

    fn tick_drain(&mut self, ev: AckEvent) {
        let bdp = self.bdp_bytes();
        if ev.bytes_in_flight <= bdp {
            self.state = BbrState::ProbeBw;
            self.cycle_index = 0;
            self.cycle_stamp_us = ev.now_us;
        }
    }

    fn tick_probe_bw(&mut self, ev: AckEvent) {
        if ev.now_us.saturating_sub(self.cycle_stamp_us) >= self.min_rtt_us.max(1) {
            self.cycle_index = (self.cycle_index + 1) % PROBE_BW_CYCLE.len();
            self.cycle_stamp_us = ev.now_us;
        }
        if ev.now_us.saturating_sub(self.min_rtt_stamp_us) > PROBE_BW_MAX_IDLE_US {
            self.state = BbrState::ProbeRtt;
            self.probe_rtt_stamp_us = Some(ev.now_us);
            self.probe_rtt_done_us = None;
        }
    }

    fn tick_probe_rtt(&mut self, ev: AckEvent) {
        let started = *self.probe_rtt_stamp_us.get_or_insert(ev.now_us);
        if self.probe_rtt_done_us.is_none() && ev.bytes_in_flight <= self.mtu * PROBE_RTT_CWND_MTU_MULTIPLE {
            self.probe_rtt_done_us = Some(ev.now_us);
        }
        if let Some(done) = self.probe_rtt_done_us {
            if ev.now_us.saturating_sub(done) >= PROBE_RTT_DURATION_US {
                self.min_rtt_stamp_us = ev.now_us;
                self.probe_rtt_stamp_us = None;
                self.probe_rtt_done_us = None;
                self.state = BbrState::ProbeBw;
                self.cycle_index = 0;
                self.cycle_stamp_us = ev.now_us;
                return;
            }
        }
        let _ = started;
    }

    fn bdp_bytes(&self) -> u64 {
        if self.min_rtt_us == u64::MAX || self.min_rtt_us == 0 {
            return self.mtu * 4;
        }
        (self.max_bw_bps * self.min_rtt_us as f64 / 1_000_000.0) as u64
    }

    fn recompute_pacing_and_cwnd(&mut self, _ev: AckEvent) {
        let (pacing_gain, cwnd_gain) = match self.state {
            BbrState::Startup => (STARTUP_PACING_GAIN, STARTUP_CWND_GAIN),
            BbrState::Drain => (DRAIN_PACING_GAIN, DRAIN_CWND_GAIN),
            BbrState::ProbeBw => (PROBE_BW_CYCLE[self.cycle_index], PROBE_BW_CWND_GAIN),
            BbrState::ProbeRtt => (1.0, 1.0),
        };
        self.pacing_rate_bps = self.max_bw_bps * pacing_gain;

        let target_cwnd = if self.state == BbrState::ProbeRtt {
            self.mtu * PROBE_RTT_CWND_MTU_MULTIPLE
        } else {
            let bdp = self.bdp_bytes();
            let mut cwnd = (bdp as f64 * cwnd_gain) as u64;
            cwnd = cwnd.max(self.mtu * 4);
            cwnd.min(self.inflight_hi)
        };
        self.cwnd_bytes = target_cwnd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(rtt_us: u64, delivered: u64, duration_us: u64, inflight: u64, lost: u64, now_us: u64) -> AckEvent {
        AckEvent { rtt_us, delivered_bytes: delivered, delivered_duration_us: duration_us, bytes_in_flight: inflight, bytes_lost: lost, now_us }
    }

    #[test]
    fn starts_in_startup_with_high_pacing_gain() {
        let bbr = BbrController::new(1200);
        assert_eq!(bbr.state(), BbrState::Startup);
    }

    #[test]
    fn startup_exits_to_drain_after_bandwidth_plateau() {
        let mut bbr = BbrController::new(1200);
        let mut now = 0u64;
        for _ in 0..2 {
            now += 50_000;
            bbr.update(event(50_000, 1_000_000, 50_000, 10_000, 0, now));
        }
        for _ in 0..STARTUP_FULL_BW_ROUNDS + 1 {
            now += 50_000;
            bbr.update(event(50_000, 1_000_000, 50_000, 10_000, 0, now));
        }
        assert_eq!(bbr.state(), BbrState::Drain);
    }

    #[test]
    fn cwnd_never_collapses_on_loss_alone() {
        let mut bbr = BbrController::new(1200);
        bbr.update(event(50_000, 2_000_000, 50_000, 200_000, 0, 50_000));
        let before = bbr.cwnd_bytes();
        bbr.update(event(50_000, 2_000_000, 50_000, 200_000, 150_000, 100_000));
        assert!(bbr.cwnd_bytes() >= bbr.mtu * 4);
        assert!(before > 0);
    }

    #[test]
    fn min_rtt_tracks_the_lowest_observed_sample() {
        let mut bbr = BbrController::new(1200);
        bbr.update(event(80_000, 1_000_000, 50_000, 10_000, 0, 50_000));
        bbr.update(event(40_000, 1_000_000, 50_000, 10_000, 0, 100_000));
        bbr.update(event(60_000, 1_000_000, 50_000, 10_000, 0, 150_000));
        assert_eq!(bbr.min_rtt_us(), 40_000);
    }
}

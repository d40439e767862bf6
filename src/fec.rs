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

//! # Adaptive Forward Error Correction
//!
//! A sliding-window systematic XOR-parity code whose redundancy (mode and
//! window size) adapts to the observed loss rate through a PID-driven mode
//! manager. Source packets pass through unmodified; repair packets are XOR
//! groups over interleaved subsets of the window, recoverable whenever a
//! group has at most one missing member.

use crate::error::{ConfigError, QuicFuscateError, Result};
use clap::ValueEnum;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum FecMode {
    Zero,
    Light,
    Normal,
    Medium,
    Strong,
    Extreme,
}

impl std::str::FromStr for FecMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "zero" => Ok(FecMode::Zero),
            "1" | "light" => Ok(FecMode::Light),
            "2" | "normal" => Ok(FecMode::Normal),
            "3" | "medium" => Ok(FecMode::Medium),
            "4" | "strong" => Ok(FecMode::Strong),
            "5" | "extreme" => Ok(FecMode::Extreme),
            _ => Err(()),
        }
    }
}

struct KalmanFilter {
    estimate: f32,
    error_cov: f32,
    q: f32,
    r: f32,
}

impl KalmanFilter {
    fn new(q: f32, r: f32) -> Self {
        Self { estimate: 0.0, error_cov: 1.0, q, r }
    }

    fn update(&mut self, measurement: f32) -> f32 {
        self.error_cov += self.q;
        let k = self.error_cov / (self.error_cov + self.r);
        self.estimate += k * (measurement - self.estimate);
        self.error_cov *= 1.0 - k;
        self.estimate
    }
}

/// Estimates packet loss using an EMA plus a burst-detection window; the
/// reported rate is the larger of the two so brief bursts are not masked by
/// a low long-term average.
pub struct LossEstimator {
    ema_loss_rate: f32,
    lambda: f32,
    burst_window: VecDeque<bool>,
    burst_capacity: usize,
    kalman: Option<KalmanFilter>,
}

impl LossEstimator {
    fn new(lambda: f32, burst_capacity: usize, kalman: Option<KalmanFilter>) -> Self {
        Self { ema_loss_rate: 0.0, lambda, burst_window: VecDeque::with_capacity(burst_capacity), burst_capacity, kalman }
    }

    pub fn report_loss(&mut self, lost: usize, total: usize) {
        let mut current_loss_rate = if total > 0 { lost as f32 / total as f32 } else { 0.0 };
        if let Some(kf) = self.kalman.as_mut() {
            current_loss_rate = kf.update(current_loss_rate);
        }
        self.ema_loss_rate = (self.lambda * current_loss_rate) + (1.0 - self.lambda) * self.ema_loss_rate;

        for _ in 0..lost {
            if self.burst_window.len() == self.burst_capacity {
                self.burst_window.pop_front();
            }
            self.burst_window.push_back(true);
        }
        for _ in 0..total.saturating_sub(lost) {
            if self.burst_window.len() == self.burst_capacity {
                self.burst_window.pop_front();
            }
            self.burst_window.push_back(false);
        }
    }

    pub fn estimated_loss(&self) -> f32 {
        let burst_loss = if self.burst_window.is_empty() {
            0.0
        } else {
            self.burst_window.iter().filter(|&&l| l).count() as f32 / self.burst_window.len() as f32
        };
        self.ema_loss_rate.max(burst_loss)
    }
}

#[derive(Clone, Copy)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

struct PidController {
    config: PidConfig,
    integral: f32,
    previous_error: f32,
    last_time: Instant,
}

impl PidController {
    fn new(config: PidConfig) -> Self {
        Self { config, integral: 0.0, previous_error: 0.0, last_time: Instant::now() }
    }

    fn update(&mut self, current_value: f32, setpoint: f32) -> f32 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_time).as_secs_f32();
        self.last_time = now;
        if dt <= 0.0 {
            return 0.0;
        }
        let error = setpoint - current_value;
        self.integral += error * dt;
        let derivative = (error - self.previous_error) / dt;
        self.previous_error = error;
        (self.config.kp * error) + (self.config.ki * self.integral) + (self.config.kd * derivative)
    }
}

/// Drives the active [`FecMode`] and window size from the PID controller's
/// output against the current mode's target loss rate, with an emergency
/// override for sudden spikes and a minimum dwell time to avoid thrashing.
pub struct ModeManager {
    current_mode: FecMode,
    pid: PidController,
    mode_thresholds: HashMap<FecMode, f32>,
    window_sizes: HashMap<FecMode, usize>,
    last_mode_change: Instant,
    min_dwell_time: Duration,
    hysteresis: f32,
    current_window: usize,
}

impl ModeManager {
    pub const CROSS_FADE_LEN: usize = 32;
    const ALPHA_K: f32 = 0.5;

    pub fn new(pid_config: PidConfig, hysteresis: f32, initial_mode: FecMode, window_sizes: HashMap<FecMode, usize>) -> Self {
        let mut mode_thresholds = HashMap::new();
        mode_thresholds.insert(FecMode::Zero, 0.01);
        mode_thresholds.insert(FecMode::Light, 0.05);
        mode_thresholds.insert(FecMode::Normal, 0.15);
        mode_thresholds.insert(FecMode::Medium, 0.30);
        mode_thresholds.insert(FecMode::Strong, 0.50);
        mode_thresholds.insert(FecMode::Extreme, 1.0);

        let current_window = window_sizes
            .get(&initial_mode)
            .copied()
            .unwrap_or_else(|| *FecConfig::default_windows().get(&initial_mode).unwrap_or(&0));

        Self {
            current_mode: initial_mode,
            pid: PidController::new(pid_config),
            mode_thresholds,
            window_sizes,
            last_mode_change: Instant::now(),
            min_dwell_time: Duration::from_millis(500),
            hysteresis,
            current_window,
        }
    }

    pub fn current_mode(&self) -> FecMode {
        self.current_mode
    }

    pub fn current_window(&self) -> usize {
        self.current_window
    }

    fn initial_window(&self, mode: FecMode) -> usize {
        self.window_sizes.get(&mode).copied().unwrap_or_else(|| *FecConfig::default_windows().get(&mode).unwrap_or(&0))
    }

    fn window_range(mode: FecMode) -> (usize, usize) {
        match mode {
            FecMode::Zero => (0, 0),
            FecMode::Light => (8, 32),
            FecMode::Normal => (32, 128),
            FecMode::Medium => (64, 256),
            FecMode::Strong => (256, 1024),
            FecMode::Extreme => (1024, 4096),
        }
    }

    /// Repair-to-source ratio for `mode`, i.e. `n / k` for a window of size
    /// `k` under this mode (spec-equivalent of the reference's Cauchy-matrix
    /// overhead ratio, now driving XOR parity-group count instead).
    pub fn overhead_ratio(mode: FecMode) -> f32 {
        match mode {
            FecMode::Zero => 1.0,
            FecMode::Light => 17.0 / 16.0,
            FecMode::Normal => 74.0 / 64.0,
            FecMode::Medium => 166.0 / 128.0,
            FecMode::Strong => 384.0 / 256.0,
            FecMode::Extreme => 2.0,
        }
    }

    pub fn params_for(mode: FecMode, window: usize) -> (usize, usize) {
        let ratio = Self::overhead_ratio(mode);
        let n = ((window as f32) * ratio).ceil() as usize;
        (window, n)
    }

    fn next_mode(mode: FecMode) -> FecMode {
        match mode {
            FecMode::Zero => FecMode::Light,
            FecMode::Light => FecMode::Normal,
            FecMode::Normal => FecMode::Medium,
            FecMode::Medium => FecMode::Strong,
            FecMode::Strong | FecMode::Extreme => FecMode::Extreme,
        }
    }

    fn prev_mode(mode: FecMode) -> FecMode {
        match mode {
            FecMode::Extreme => FecMode::Strong,
            FecMode::Strong => FecMode::Medium,
            FecMode::Medium => FecMode::Normal,
            FecMode::Normal => FecMode::Light,
            FecMode::Light | FecMode::Zero => FecMode::Zero,
        }
    }

    /// Recomputes mode and window from an updated loss estimate. Returns the
    /// new (mode, window) and, when a transition starts, the previous
    /// (mode, window) pair so the caller can cross-fade encoders.
    pub fn update(&mut self, estimated_loss: f32) -> (FecMode, usize, Option<(FecMode, usize)>) {
        if estimated_loss > self.mode_thresholds[&FecMode::Strong] + self.hysteresis {
            let prev = (self.current_mode, self.current_window);
            self.current_mode = FecMode::Extreme;
            self.current_window = self.initial_window(self.current_mode);
            self.last_mode_change = Instant::now();
            return (self.current_mode, self.current_window, Some(prev));
        }

        if self.last_mode_change.elapsed() < self.min_dwell_time {
            return (self.current_mode, self.current_window, None);
        }

        let target_loss = self.mode_thresholds[&self.current_mode];
        let output = self.pid.update(estimated_loss, target_loss);

        let mut new_mode = self.current_mode;
        if output > 0.1 {
            new_mode = Self::next_mode(self.current_mode);
        } else if output < -0.1 {
            new_mode = Self::prev_mode(self.current_mode);
        }

        let prev_mode = self.current_mode;
        let prev_window = self.current_window;

        if new_mode != self.current_mode {
            self.current_mode = new_mode;
            self.last_mode_change = Instant::now();
            self.current_window = self.initial_window(new_mode);
        }

        let target_loss_for_mode = self.mode_thresholds[&self.current_mode];
        let alpha = 1.0 + Self::ALPHA_K * (estimated_loss - target_loss_for_mode);
        let range = Self::window_range(self.current_mode);
        let mut new_window = ((self.current_window as f32) * alpha).round() as usize;
        new_window = new_window.clamp(range.0, range.1.max(range.0));
        self.current_window = new_window;

        if prev_mode != self.current_mode || prev_window != self.current_window {
            return (self.current_mode, self.current_window, Some((prev_mode, prev_window)));
        }
        (self.current_mode, self.current_window, None)
    }
}

/// A systematic XOR-parity code: `k` source packets (passed through
/// unmodified) plus `n - k` parity packets, each the XOR of an interleaved
/// subset of the window (`source index % repair_count == group index`). A
/// missing source packet is recoverable whenever its parity group has no
/// other missing member.
pub struct XorCodec {
    k: usize,
    n: usize,
}

impl XorCodec {
    pub fn new(k: usize, n: usize) -> Self {
        Self { k, n: n.max(k) }
    }

    fn repair_count(&self) -> usize {
        self.n - self.k
    }

    /// Produces the `n - k` parity packets for a full window of `k` equal
    /// length source packets.
    pub fn encode(&self, sources: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if sources.len() != self.k {
            return Err(QuicFuscateError::Config(ConfigError::InvalidArgument(format!(
                "expected {} source packets, got {}",
                self.k,
                sources.len()
            ))));
        }
        let repair_count = self.repair_count();
        if repair_count == 0 {
            return Ok(Vec::new());
        }
        let block_len = sources.iter().map(|p| p.len()).max().unwrap_or(0);
        let mut parity = vec![vec![0u8; block_len]; repair_count];
        for (i, packet) in sources.iter().enumerate() {
            let group = i % repair_count;
            for (b, &byte) in packet.iter().enumerate() {
                parity[group][b] ^= byte;
            }
        }
        Ok(parity)
    }

    /// Recovers as many missing source slots as possible in place, given the
    /// parity packets for the same window. Returns the number recovered.
    pub fn decode(&self, sources: &mut [Option<Vec<u8>>], parity: &[Option<Vec<u8>>]) -> usize {
        let repair_count = self.repair_count();
        if repair_count == 0 || sources.len() != self.k || parity.len() != repair_count {
            return 0;
        }
        let mut recovered = 0;
        loop {
            let mut progressed = false;
            for group in 0..repair_count {
                let Some(parity_packet) = &parity[group] else { continue };
                let members: Vec<usize> = (0..self.k).filter(|i| i % repair_count == group).collect();
                let missing: Vec<usize> = members.iter().copied().filter(|i| sources[*i].is_none()).collect();
                if missing.len() != 1 {
                    continue;
                }
                let target = missing[0];
                let mut buf = parity_packet.clone();
                for &i in &members {
                    if i == target {
                        continue;
                    }
                    if let Some(p) = &sources[i] {
                        for (b, &byte) in p.iter().enumerate() {
                            buf[b] ^= byte;
                        }
                    }
                }
                sources[target] = Some(buf);
                recovered += 1;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        recovered
    }
}

/// Runtime configuration for the adaptive FEC engine (spec-equivalent of the
/// reference's `adaptive_fec` TOML table).
#[derive(Clone)]
pub struct FecConfig {
    pub lambda: f32,
    pub burst_window: usize,
    pub hysteresis: f32,
    pub pid: PidConfig,
    pub initial_mode: FecMode,
    pub kalman_enabled: bool,
    pub kalman_q: f32,
    pub kalman_r: f32,
    pub window_sizes: HashMap<FecMode, usize>,
}

impl FecConfig {
    pub fn default_windows() -> HashMap<FecMode, usize> {
        use FecMode::*;
        let mut m = HashMap::new();
        m.insert(Zero, 0);
        m.insert(Light, 16);
        m.insert(Normal, 64);
        m.insert(Medium, 128);
        m.insert(Strong, 512);
        m.insert(Extreme, 1024);
        m
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct Root {
            adaptive_fec: Adaptive,
        }
        #[derive(serde::Deserialize)]
        struct Adaptive {
            lambda: Option<f32>,
            burst_window: Option<usize>,
            hysteresis: Option<f32>,
            pid: Option<PidSection>,
            kalman_enabled: Option<bool>,
            kalman_q: Option<f32>,
            kalman_r: Option<f32>,
            modes: Option<Vec<ModeSection>>,
        }
        #[derive(serde::Deserialize)]
        struct PidSection {
            kp: f32,
            ki: f32,
            kd: f32,
        }
        #[derive(serde::Deserialize)]
        struct ModeSection {
            name: String,
            w0: usize,
        }

        let raw: Root = toml::from_str(s)
            .map_err(|e| QuicFuscateError::Config(ConfigError::InvalidArgument(e.to_string())))?;
        let af = raw.adaptive_fec;
        let pid = af.pid.unwrap_or(PidSection { kp: 0.5, ki: 0.1, kd: 0.2 });
        let mut windows = FecConfig::default_windows();
        if let Some(modes) = af.modes {
            for msec in modes {
                if let Ok(mode) = msec.name.parse() {
                    windows.insert(mode, msec.w0);
                }
            }
        }
        Ok(FecConfig {
            lambda: af.lambda.unwrap_or(0.1),
            burst_window: af.burst_window.unwrap_or(20),
            hysteresis: af.hysteresis.unwrap_or(0.02),
            pid: PidConfig { kp: pid.kp, ki: pid.ki, kd: pid.kd },
            initial_mode: FecMode::Zero,
            kalman_enabled: af.kalman_enabled.unwrap_or(false),
            kalman_q: af.kalman_q.unwrap_or(0.001),
            kalman_r: af.kalman_r.unwrap_or(0.01),
            window_sizes: windows,
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QuicFuscateError::Config(ConfigError::InvalidArgument(e.to_string())))?;
        Self::from_toml(&contents)
    }
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            burst_window: 20,
            hysteresis: 0.02,
            pid: PidConfig { kp: 0.5, ki: 0.1, kd: 0.2 },
            initial_mode: FecMode::Zero,
            kalman_enabled: false,
            kalman_q: 0.001,
            kalman_r: 0.01,
            window_sizes: FecConfig::default_windows(),
        }
    }
}

/// Ties the loss estimator, mode manager, and XOR codec together into the
/// single collaborator the connection core drives on every send/receive
/// batch.
pub struct AdaptiveFec {
    estimator: Arc<Mutex<LossEstimator>>,
    mode_mgr: Arc<Mutex<ModeManager>>,
    codec: XorCodec,
    config: FecConfig,
}

impl AdaptiveFec {
    pub fn new(config: FecConfig) -> Self {
        let kalman = if config.kalman_enabled { Some(KalmanFilter::new(config.kalman_q, config.kalman_r)) } else { None };
        let estimator = Arc::new(Mutex::new(LossEstimator::new(config.lambda, config.burst_window, kalman)));
        let mode_mgr = Arc::new(Mutex::new(ModeManager::new(config.pid, config.hysteresis, config.initial_mode, config.window_sizes.clone())));
        let window = mode_mgr.lock().unwrap().current_window();
        let (k, n) = ModeManager::params_for(config.initial_mode, window);
        Self { estimator, mode_mgr, codec: XorCodec::new(k.max(1), n.max(k.max(1))), config }
    }

    pub fn report_loss(&self, lost: usize, total: usize) {
        self.estimator.lock().unwrap().report_loss(lost, total);
    }

    /// Consumes the latest loss estimate, possibly retuning the mode/window
    /// and rebuilding the codec for the new window size.
    pub fn retune(&mut self) -> FecMode {
        let estimated = self.estimator.lock().unwrap().estimated_loss();
        let (mode, window, _) = self.mode_mgr.lock().unwrap().update(estimated);
        let (k, n) = ModeManager::params_for(mode, window);
        self.codec = XorCodec::new(k.max(1), n.max(k.max(1)));
        mode
    }

    pub fn current_mode(&self) -> FecMode {
        self.mode_mgr.lock().unwrap().current_mode()
    }

    pub fn encode(&self, sources: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        self.codec.encode(sources)
    }

    pub fn decode(&self, sources: &mut [Option<Vec<u8>>], parity: &[Option<Vec<u8>>]) -> usize {
        self.codec.decode(sources, parity)
    }

    pub fn config(&self) -> &FecConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_codec_recovers_single_lost_source_per_group() {
        let codec = XorCodec::new(4, 6);
        let sources = vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8]];
        let parity = codec.encode(&sources).unwrap();
        assert_eq!(parity.len(), 2);

        let mut received: Vec<Option<Vec<u8>>> = sources.iter().cloned().map(Some).collect();
        received[0] = None;
        let parity_opt: Vec<Option<Vec<u8>>> = parity.into_iter().map(Some).collect();
        let recovered = codec.decode(&mut received, &parity_opt);
        assert_eq!(recovered, 1);
        assert_eq!(received[0], Some(vec![1, 2]));
    }

    #[test]
    fn decode_gives_up_when_a_group_loses_two_members() {
        let codec = XorCodec::new(2, 3);
        let sources = vec![vec![9], vec![10]];
        let parity = codec.encode(&sources).unwrap();
        let mut received: Vec<Option<Vec<u8>>> = vec![None, None];
        let parity_opt: Vec<Option<Vec<u8>>> = parity.into_iter().map(Some).collect();
        let recovered = codec.decode(&mut received, &parity_opt);
        assert_eq!(recovered, 0);
    }

    #[test]
    fn loss_estimator_reflects_reported_rate() {
        let mut est = LossEstimator::new(1.0, 10, None);
        est.report_loss(5, 10);
        assert!((est.estimated_loss() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mode_manager_escalates_to_extreme_on_loss_spike() {
        let mut mgr = ModeManager::new(PidConfig { kp: 0.5, ki: 0.1, kd: 0.1 }, 0.02, FecMode::Zero, FecConfig::default_windows());
        let (mode, _, transition) = mgr.update(0.9);
        assert_eq!(mode, FecMode::Extreme);
        assert!(transition.is_some());
    }

    #[test]
    fn fec_mode_from_str_accepts_aliases() {
        assert_eq!("strong".parse::<FecMode>(), Ok(FecMode::Strong));
        assert_eq!("3".parse::<FecMode>(), Ok(FecMode::Medium));
    }
}

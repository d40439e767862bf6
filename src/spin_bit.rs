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

//! # Spin-Bit Module
//!
//! Rewrites the QUIC short-header spin bit (bit 5 of the first byte) on
//! every outbound 1-RTT packet per the configured strategy. Long-header
//! packets carry no spin bit and are left untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const SPIN_BIT_MASK: u8 = 0x20;
const LONG_HEADER_MASK: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinBitStrategy {
    ConstantZero,
    ConstantOne,
    Random { flip_probability_percent: u8 },
    Alternating { interval: Duration },
    TimingBased,
    Mimicry,
}

pub struct SpinBitRandomizer {
    strategy: SpinBitStrategy,
    enabled: bool,
    start_time: Instant,
    mimicry_pattern: Vec<u8>,
    pattern_index: AtomicU64,
}

impl SpinBitRandomizer {
    pub fn new(strategy: SpinBitStrategy) -> Self {
        Self {
            strategy,
            enabled: true,
            start_time: Instant::now(),
            mimicry_pattern: Vec::new(),
            pattern_index: AtomicU64::new(0),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_strategy(&mut self, strategy: SpinBitStrategy) {
        self.strategy = strategy;
    }

    pub fn strategy(&self) -> SpinBitStrategy {
        self.strategy
    }

    pub fn set_mimicry_pattern(&mut self, pattern: Vec<u8>) {
        self.mimicry_pattern = pattern;
        self.pattern_index.store(0, Ordering::SeqCst);
    }

    /// Rewrites the spin bit in `packet`'s first byte in place, returning the
    /// bit value that was set. Long-header packets and buffers too short to
    /// be a QUIC packet are returned unchanged.
    pub fn set_spin_bit(&self, packet: &mut [u8], original_bit: bool) -> bool {
        if !self.enabled || packet.len() < 5 {
            return original_bit;
        }
        if packet[0] & LONG_HEADER_MASK != 0 {
            return original_bit;
        }
        let new_bit = self.generate(original_bit);
        if new_bit {
            packet[0] |= SPIN_BIT_MASK;
        } else {
            packet[0] &= !SPIN_BIT_MASK;
        }
        new_bit
    }

    fn generate(&self, original_bit: bool) -> bool {
        match self.strategy {
            SpinBitStrategy::ConstantZero => false,
            SpinBitStrategy::ConstantOne => true,
            SpinBitStrategy::Random { flip_probability_percent } => {
                use rand::Rng;
                let roll: u8 = rand::thread_rng().gen_range(0..100);
                if roll < flip_probability_percent {
                    !original_bit
                } else {
                    original_bit
                }
            }
            SpinBitStrategy::Alternating { interval } => {
                let elapsed = self.start_time.elapsed();
                let intervals = elapsed.as_millis() / interval.as_millis().max(1);
                intervals % 2 != 0
            }
            SpinBitStrategy::TimingBased => {
                let elapsed_us = self.start_time.elapsed().as_micros();
                let time_bit = (elapsed_us % 1000) < 500;
                time_bit ^ original_bit
            }
            SpinBitStrategy::Mimicry => {
                if self.mimicry_pattern.is_empty() {
                    return original_bit;
                }
                let idx = self.pattern_index.load(Ordering::SeqCst) as usize;
                let bit = (self.mimicry_pattern[idx / 8] & (1 << (idx % 8))) != 0;
                let total_bits = self.mimicry_pattern.len() * 8;
                self.pattern_index.store(((idx + 1) % total_bits) as u64, Ordering::SeqCst);
                bit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_header_packet() -> Vec<u8> {
        vec![0x40, 0, 0, 0, 0]
    }

    #[test]
    fn long_header_packets_are_untouched() {
        let randomizer = SpinBitRandomizer::new(SpinBitStrategy::ConstantOne);
        let mut packet = vec![0xC0, 0, 0, 0, 0];
        let original = packet.clone();
        let result = randomizer.set_spin_bit(&mut packet, false);
        assert_eq!(packet, original);
        assert!(!result);
    }

    #[test]
    fn constant_zero_always_clears_bit() {
        let randomizer = SpinBitRandomizer::new(SpinBitStrategy::ConstantZero);
        let mut packet = short_header_packet();
        packet[0] |= SPIN_BIT_MASK;
        assert!(!randomizer.set_spin_bit(&mut packet, true));
        assert_eq!(packet[0] & SPIN_BIT_MASK, 0);
    }

    #[test]
    fn constant_one_always_sets_bit() {
        let randomizer = SpinBitRandomizer::new(SpinBitStrategy::ConstantOne);
        let mut packet = short_header_packet();
        assert!(randomizer.set_spin_bit(&mut packet, false));
        assert_ne!(packet[0] & SPIN_BIT_MASK, 0);
    }

    #[test]
    fn mimicry_cycles_through_pattern_bits() {
        let mut randomizer = SpinBitRandomizer::new(SpinBitStrategy::Mimicry);
        randomizer.set_mimicry_pattern(vec![0b0000_0101]); // bits: 1,0,1,0,0,0,0,0
        let expected = [true, false, true, false, false, false, false, false, true];
        for &want in &expected {
            let mut packet = short_header_packet();
            let got = randomizer.set_spin_bit(&mut packet, false);
            assert_eq!(got, want);
        }
    }

    #[test]
    fn disabled_randomizer_preserves_original_bit() {
        let mut randomizer = SpinBitRandomizer::new(SpinBitStrategy::ConstantOne);
        randomizer.disable();
        let mut packet = short_header_packet();
        assert!(!randomizer.set_spin_bit(&mut packet, false));
    }
}

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

//! # Varint Module
//!
//! QUIC-style variable-length integer encoding: a 2-bit length prefix in the
//! high bits of the first byte selects 1, 2, 4 or 8 byte encodings carrying
//! 6, 14, 30 or 62 data bits respectively.

use thiserror::Error;

pub const MAX_VARINT: u64 = (1u64 << 62) - 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    #[error("fewer bytes remain than the length prefix demands")]
    Truncated,
    #[error("value requires more than 62 bits")]
    Overlarge,
}

/// Encodes `v` into 1, 2, 4 or 8 bytes, appending to `out`. Returns the number
/// of bytes written.
pub fn encode(v: u64, out: &mut Vec<u8>) -> Result<usize, VarintError> {
    if v > MAX_VARINT {
        return Err(VarintError::Overlarge);
    }
    if v <= 0x3f {
        out.push(v as u8);
        Ok(1)
    } else if v <= 0x3fff {
        let bytes = (v as u16 | 0x4000).to_be_bytes();
        out.extend_from_slice(&bytes);
        Ok(2)
    } else if v <= 0x3fff_ffff {
        let bytes = (v as u32 | 0x8000_0000).to_be_bytes();
        out.extend_from_slice(&bytes);
        Ok(4)
    } else {
        let bytes = (v | 0xC000_0000_0000_0000).to_be_bytes();
        out.extend_from_slice(&bytes);
        Ok(8)
    }
}

/// Convenience wrapper returning a freshly allocated buffer.
pub fn encode_to_vec(v: u64) -> Result<Vec<u8>, VarintError> {
    let mut out = Vec::with_capacity(8);
    encode(v, &mut out)?;
    Ok(out)
}

/// Returns the number of bytes `encode(v)` would produce, without allocating.
pub fn encoded_len(v: u64) -> Result<usize, VarintError> {
    if v > MAX_VARINT {
        return Err(VarintError::Overlarge);
    }
    Ok(if v <= 0x3f {
        1
    } else if v <= 0x3fff {
        2
    } else if v <= 0x3fff_ffff {
        4
    } else {
        8
    })
}

/// Decodes a varint from the start of `buf`. Returns the decoded value and
/// the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let first = *buf.first().ok_or(VarintError::Truncated)?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(VarintError::Truncated);
    }
    let mut value = (first & 0x3f) as u64;
    for &b in &buf[1..len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sample_values() {
        for &v in &[0u64, 1, 63, 64, 16383, 16384, 1 << 29, MAX_VARINT] {
            let encoded = encode_to_vec(v).unwrap();
            let (decoded, len) = decode(&encoded).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn boundary_encodings_match_spec() {
        assert_eq!(encode_to_vec(63).unwrap(), vec![0x3F]);
        assert_eq!(encode_to_vec(64).unwrap(), vec![0x40, 0x40]);
        assert_eq!(encode_to_vec(16383).unwrap(), vec![0x7F, 0xFF]);
        assert_eq!(encode_to_vec(16384).unwrap(), vec![0x80, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn overlarge_value_rejected() {
        assert_eq!(encode_to_vec(1u64 << 62), Err(VarintError::Overlarge));
    }

    #[test]
    fn truncated_buffer_rejected() {
        assert_eq!(decode(&[]), Err(VarintError::Truncated));
        assert_eq!(decode(&[0x80]), Err(VarintError::Truncated));
    }

    #[test]
    fn exhaustive_small_range_round_trips() {
        for v in 0..=100_000u64 {
            let encoded = encode_to_vec(v).unwrap();
            assert_eq!(encoded.len(), encoded_len(v).unwrap());
            let (decoded, len) = decode(&encoded).unwrap();
            assert_eq!((decoded, len), (v, encoded.len()));
        }
    }
}

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

//! # HTTP/3 Frame Module
//!
//! Typed HTTP/3 frame codec: `<type:varint><length:varint><payload>`.
//! Unknown frame types are preserved as opaque payloads rather than rejected,
//! so a peer running a newer extension still round-trips cleanly.

use crate::varint;
use thiserror::Error;

const FRAME_DATA: u64 = 0x0;
const FRAME_HEADERS: u64 = 0x1;
const FRAME_CANCEL_PUSH: u64 = 0x3;
const FRAME_SETTINGS: u64 = 0x4;
const FRAME_PUSH_PROMISE: u64 = 0x5;
const FRAME_GOAWAY: u64 = 0x7;
const FRAME_MAX_PUSH_ID: u64 = 0xd;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer truncated")]
    Truncated,
    #[error("malformed settings payload")]
    MalformedSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Headers(Vec<u8>),
    CancelPush(u64),
    Settings(Vec<(u64, u64)>),
    PushPromise { push_id: u64, headers: Vec<u8> },
    Goaway(u64),
    MaxPushId(u64),
    Unknown { frame_type: u64, payload: Vec<u8> },
}

impl Frame {
    fn frame_type(&self) -> u64 {
        match self {
            Frame::Data(_) => FRAME_DATA,
            Frame::Headers(_) => FRAME_HEADERS,
            Frame::CancelPush(_) => FRAME_CANCEL_PUSH,
            Frame::Settings(_) => FRAME_SETTINGS,
            Frame::PushPromise { .. } => FRAME_PUSH_PROMISE,
            Frame::Goaway(_) => FRAME_GOAWAY,
            Frame::MaxPushId(_) => FRAME_MAX_PUSH_ID,
            Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Data(b) => b.clone(),
            Frame::Headers(b) => b.clone(),
            Frame::CancelPush(id) => varint::encode_to_vec(*id).expect("push id fits"),
            Frame::Settings(pairs) => {
                let mut out = Vec::new();
                for (id, val) in pairs {
                    varint::encode(*id, &mut out).expect("settings id fits");
                    varint::encode(*val, &mut out).expect("settings value fits");
                }
                out
            }
            Frame::PushPromise { push_id, headers } => {
                let mut out = varint::encode_to_vec(*push_id).expect("push id fits");
                out.extend_from_slice(headers);
                out
            }
            Frame::Goaway(id) => varint::encode_to_vec(*id).expect("stream id fits"),
            Frame::MaxPushId(id) => varint::encode_to_vec(*id).expect("push id fits"),
            Frame::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Serializes this frame to its wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::new();
        varint::encode(self.frame_type(), &mut out).expect("frame type fits");
        varint::encode(payload.len() as u64, &mut out).expect("frame length fits");
        out.extend_from_slice(&payload);
        out
    }

    fn from_parts(frame_type: u64, payload: &[u8]) -> Result<Self, FrameError> {
        Ok(match frame_type {
            FRAME_DATA => Frame::Data(payload.to_vec()),
            FRAME_HEADERS => Frame::Headers(payload.to_vec()),
            FRAME_CANCEL_PUSH => {
                let (id, _) = varint::decode(payload).map_err(|_| FrameError::Truncated)?;
                Frame::CancelPush(id)
            }
            FRAME_SETTINGS => {
                let mut pairs = Vec::new();
                let mut pos = 0;
                while pos < payload.len() {
                    let (id, n1) = varint::decode(&payload[pos..]).map_err(|_| FrameError::MalformedSettings)?;
                    pos += n1;
                    let (val, n2) = varint::decode(&payload[pos..]).map_err(|_| FrameError::MalformedSettings)?;
                    pos += n2;
                    pairs.push((id, val));
                }
                Frame::Settings(pairs)
            }
            FRAME_PUSH_PROMISE => {
                let (push_id, n) = varint::decode(payload).map_err(|_| FrameError::Truncated)?;
                Frame::PushPromise { push_id, headers: payload[n..].to_vec() }
            }
            FRAME_GOAWAY => {
                let (id, _) = varint::decode(payload).map_err(|_| FrameError::Truncated)?;
                Frame::Goaway(id)
            }
            FRAME_MAX_PUSH_ID => {
                let (id, _) = varint::decode(payload).map_err(|_| FrameError::Truncated)?;
                Frame::MaxPushId(id)
            }
            other => Frame::Unknown { frame_type: other, payload: payload.to_vec() },
        })
    }
}

/// Attempts to parse one frame from the start of `buf`. Returns `Ok(None)`
/// (with `bytes_consumed` left at 0) if the declared length exceeds what is
/// currently buffered, so callers can wait for more bytes without losing
/// their place in the stream.
pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    let (frame_type, n1) = match varint::decode(buf) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let rest = &buf[n1..];
    let (length, n2) = match varint::decode(rest) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let length = length as usize;
    let header_len = n1 + n2;
    if buf.len() < header_len + length {
        return Ok(None);
    }
    let payload = &buf[header_len..header_len + length];
    let frame = Frame::from_parts(frame_type, payload)?;
    Ok(Some((frame, header_len + length)))
}

/// Parses every complete frame available in `buf`, returning the frames and
/// the total number of bytes consumed (a trailing partial frame is left
/// unconsumed for the next call).
pub fn parse_all(buf: &[u8]) -> Result<(Vec<Frame>, usize), FrameError> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match parse(&buf[pos..])? {
            Some((frame, consumed)) => {
                frames.push(frame);
                pos += consumed;
            }
            None => break,
        }
    }
    Ok((frames, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_matches_spec_scenario() {
        let frame = Frame::Data(b"hi".to_vec());
        assert_eq!(frame.serialize(), vec![0x00, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn round_trips_every_typed_frame() {
        let frames = vec![
            Frame::Data(b"payload".to_vec()),
            Frame::Headers(vec![0xD1]),
            Frame::CancelPush(42),
            Frame::Settings(vec![(1, 4096), (7, 100)]),
            Frame::PushPromise { push_id: 3, headers: vec![0x01, 0x02] },
            Frame::Goaway(9),
            Frame::MaxPushId(5),
            Frame::Unknown { frame_type: 0x21, payload: vec![0xAA, 0xBB] },
        ];
        for frame in frames {
            let bytes = frame.serialize();
            let (parsed, consumed) = parse(&bytes).unwrap().unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let full = Frame::Data(b"hello world".to_vec()).serialize();
        let partial = &full[..full.len() - 3];
        assert_eq!(parse(partial).unwrap(), None);
    }

    #[test]
    fn parse_all_stops_at_trailing_partial_frame() {
        let mut buf = Frame::Data(b"a".to_vec()).serialize();
        buf.extend_from_slice(&Frame::Goaway(1).serialize());
        let full_len = buf.len();
        buf.extend_from_slice(&[0x00, 0x05, 0x01, 0x02]); // declares 5 bytes, only 2 present

        let (frames, consumed) = parse_all(&buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(consumed, full_len);
    }

    #[test]
    fn unknown_frame_type_is_preserved() {
        let frame = Frame::Unknown { frame_type: 0x2a, payload: vec![1, 2, 3] };
        let bytes = frame.serialize();
        let (parsed, _) = parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }
}

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

//! # SNI Module
//!
//! Edits the `server_name` extension inside a TLS ClientHello buffer
//! (record header + handshake header + extensions block, all with their own
//! length prefixes). Every edit here keeps the nested length fields —
//! server-name, server-name-list, extension, extensions-block, handshake,
//! record — equal to their true content length; a mismatch anywhere is the
//! one fatal failure mode this module can produce.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SniError {
    #[error("ClientHello buffer is malformed: {0}")]
    MalformedClientHello(String),
    #[error("edit would overflow a 16-bit length field")]
    LengthOverflow,
    #[error("no server_name extension present")]
    NoSniExtension,
}

const SNI_EXTENSION_TYPE: u16 = 0x0000;
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

struct ClientHello {
    buf: Vec<u8>,
    extensions_block_offset: usize,
    sni_extension_offset: Option<usize>,
}

fn parse(buf: &[u8]) -> Result<ClientHello, SniError> {
    if buf.len() < RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN {
        return Err(SniError::MalformedClientHello("buffer shorter than fixed headers".into()));
    }
    // Handshake body: 2 (version) + 32 (random) + 1+session_id + 2+cipher_suites
    // + 1+compression_methods, then a 2-byte extensions-block length.
    let hs_body = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;
    let mut pos = hs_body + 2 + 32;
    pos += 1 + *buf.get(pos).ok_or_else(|| SniError::MalformedClientHello("truncated session id".into()))? as usize;
    let cs_len = u16::from_be_bytes(
        buf.get(pos..pos + 2).ok_or_else(|| SniError::MalformedClientHello("truncated cipher suites".into()))?.try_into().unwrap(),
    ) as usize;
    pos += 2 + cs_len;
    let comp_len = *buf.get(pos).ok_or_else(|| SniError::MalformedClientHello("truncated compression methods".into()))? as usize;
    pos += 1 + comp_len;

    if buf.len() < pos + 2 {
        return Err(SniError::MalformedClientHello("missing extensions-block length".into()));
    }
    let extensions_block_offset = pos;
    let ext_block_len = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    let ext_end = pos + ext_block_len;
    if buf.len() < ext_end {
        return Err(SniError::MalformedClientHello("extensions block shorter than declared".into()));
    }

    let mut sni_extension_offset = None;
    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap());
        let ext_len = u16::from_be_bytes(buf[pos + 2..pos + 4].try_into().unwrap()) as usize;
        if ext_type == SNI_EXTENSION_TYPE {
            sni_extension_offset = Some(pos);
        }
        pos += 4 + ext_len;
    }

    Ok(ClientHello { buf: buf.to_vec(), extensions_block_offset, sni_extension_offset })
}

fn write_u16(buf: &mut [u8], offset: usize, value: usize) -> Result<(), SniError> {
    if value > u16::MAX as usize {
        return Err(SniError::LengthOverflow);
    }
    buf[offset..offset + 2].copy_from_slice(&(value as u16).to_be_bytes());
    Ok(())
}

/// Propagates a byte-count delta from the SNI extension outward to the
/// extensions-block, handshake and record length fields.
fn propagate_delta(ch: &mut ClientHello, delta: isize) -> Result<(), SniError> {
    let ext_block_len = u16::from_be_bytes(ch.buf[ch.extensions_block_offset..ch.extensions_block_offset + 2].try_into().unwrap()) as isize;
    write_u16(&mut ch.buf, ch.extensions_block_offset, (ext_block_len + delta) as usize)?;

    let handshake_len_offset = RECORD_HEADER_LEN + 1;
    let handshake_len = u32::from_be_bytes([0, ch.buf[handshake_len_offset], ch.buf[handshake_len_offset + 1], ch.buf[handshake_len_offset + 2]]) as isize;
    let new_handshake_len = handshake_len + delta;
    let bytes = (new_handshake_len as u32).to_be_bytes();
    ch.buf[handshake_len_offset..handshake_len_offset + 3].copy_from_slice(&bytes[1..]);

    let record_len_offset = 3;
    let record_len = u16::from_be_bytes(ch.buf[record_len_offset..record_len_offset + 2].try_into().unwrap()) as isize;
    write_u16(&mut ch.buf, record_len_offset, (record_len + delta) as usize)?;
    Ok(())
}

/// Inserts a zero byte near the midpoint of the hostname inside the
/// server_name extension, keeping every nested length field consistent.
pub fn split(buf: &[u8]) -> Result<Vec<u8>, SniError> {
    let mut ch = parse(buf)?;
    let ext_offset = ch.sni_extension_offset.ok_or(SniError::NoSniExtension)?;
    // extension: type(2) len(2) | server-name-list: len(2) | entry: type(1) name-len(2) name
    let list_len_offset = ext_offset + 4;
    let name_len_offset = list_len_offset + 3;
    let name_offset = name_len_offset + 2;
    let name_len = u16::from_be_bytes(ch.buf[name_len_offset..name_len_offset + 2].try_into().unwrap()) as usize;
    let mid = name_offset + name_len / 2;

    ch.buf.insert(mid, 0u8);

    write_u16(&mut ch.buf, ext_offset + 2, {
        let ext_len = u16::from_be_bytes(ch.buf[ext_offset + 2..ext_offset + 4].try_into().unwrap()) as usize;
        ext_len + 1
    })?;
    write_u16(&mut ch.buf, list_len_offset, {
        let list_len = u16::from_be_bytes(ch.buf[list_len_offset..list_len_offset + 2].try_into().unwrap()) as usize;
        list_len + 1
    })?;
    write_u16(&mut ch.buf, name_len_offset, name_len + 1)?;
    propagate_delta(&mut ch, 1)?;
    Ok(ch.buf)
}

/// Appends zero padding bytes after the hostname so the ClientHello reaches
/// `target_len` total bytes. A no-op if the buffer is already at least that
/// long.
pub fn pad(buf: &[u8], target_len: usize) -> Result<Vec<u8>, SniError> {
    let ch = parse(buf)?;
    if ch.buf.len() >= target_len {
        return Ok(ch.buf);
    }
    let ext_offset = ch.sni_extension_offset.ok_or(SniError::NoSniExtension)?;
    let name_len_offset = ext_offset + 4 + 3;
    let name_offset = name_len_offset + 2;
    let name_len = u16::from_be_bytes(ch.buf[name_len_offset..name_len_offset + 2].try_into().unwrap()) as usize;
    let insert_at = name_offset + name_len;
    let pad_len = target_len - ch.buf.len();

    let mut ch = ch;
    ch.buf.splice(insert_at..insert_at, std::iter::repeat(0u8).take(pad_len));
    write_u16(&mut ch.buf, ext_offset + 2, {
        let ext_len = u16::from_be_bytes(ch.buf[ext_offset + 2..ext_offset + 4].try_into().unwrap()) as usize;
        ext_len + pad_len
    })?;
    write_u16(&mut ch.buf, ext_offset + 4, {
        let list_len = u16::from_be_bytes(ch.buf[ext_offset + 4..ext_offset + 6].try_into().unwrap()) as usize;
        list_len + pad_len
    })?;
    write_u16(&mut ch.buf, name_len_offset, name_len + pad_len)?;
    propagate_delta(&mut ch, pad_len as isize)?;
    Ok(ch.buf)
}

/// Removes the server_name extension entirely. Some servers reject a
/// ClientHello with no SNI; callers opt into this explicitly.
pub fn omit(buf: &[u8]) -> Result<Vec<u8>, SniError> {
    let mut ch = parse(buf)?;
    let ext_offset = ch.sni_extension_offset.ok_or(SniError::NoSniExtension)?;
    let ext_len = u16::from_be_bytes(ch.buf[ext_offset + 2..ext_offset + 4].try_into().unwrap()) as usize;
    let total = 4 + ext_len;
    ch.buf.drain(ext_offset..ext_offset + total);
    propagate_delta(&mut ch, -(total as isize))?;
    Ok(ch.buf)
}

/// Replaces the SNI hostname with `front_host` while leaving the inner HTTP
/// `Host` (applied separately by the masquerading pipeline) carrying the
/// real hostname. Purely a textual substitution plus length fixups.
pub fn front(buf: &[u8], front_host: &str) -> Result<Vec<u8>, SniError> {
    let mut ch = parse(buf)?;
    let ext_offset = ch.sni_extension_offset.ok_or(SniError::NoSniExtension)?;
    let name_len_offset = ext_offset + 4 + 3;
    let name_offset = name_len_offset + 2;
    let name_len = u16::from_be_bytes(ch.buf[name_len_offset..name_len_offset + 2].try_into().unwrap()) as usize;
    let new_bytes = front_host.as_bytes();
    let delta = new_bytes.len() as isize - name_len as isize;

    ch.buf.splice(name_offset..name_offset + name_len, new_bytes.iter().copied());
    write_u16(&mut ch.buf, name_len_offset, new_bytes.len())?;
    write_u16(&mut ch.buf, ext_offset + 2, {
        let ext_len = u16::from_be_bytes(ch.buf[ext_offset + 2..ext_offset + 4].try_into().unwrap()) as isize;
        (ext_len + delta) as usize
    })?;
    write_u16(&mut ch.buf, ext_offset + 4, {
        let list_len = u16::from_be_bytes(ch.buf[ext_offset + 4..ext_offset + 6].try_into().unwrap()) as isize;
        (list_len + delta) as usize
    })?;
    propagate_delta(&mut ch, delta)?;
    Ok(ch.buf)
}

/// Builds a minimal well-formed ClientHello-shaped buffer carrying `hostname`
/// as its only extension, for testing.
#[cfg(test)]
pub fn build_test_client_hello(hostname: &str) -> Vec<u8> {
    let host = hostname.as_bytes();
    let mut sni_entry = vec![0u8]; // name type: host_name
    sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_entry.extend_from_slice(host);

    let mut sni_list = Vec::new();
    sni_list.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
    sni_list.extend_from_slice(&sni_entry);

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&SNI_EXTENSION_TYPE.to_be_bytes());
    sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_list);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy version
    body.extend(std::iter::repeat(0u8).take(32)); // random
    body.push(0); // session id len
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // compression methods len
    body.push(0);
    body.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes()); // extensions-block len
    body.extend_from_slice(&sni_ext);

    let mut handshake = vec![0x01]; // ClientHello
    handshake.extend_from_slice(&[0, 0, 0]); // length placeholder
    let hs_len = body.len() as u32;
    handshake[1..4].copy_from_slice(&hs_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_len(buf: &[u8]) -> usize {
        u16::from_be_bytes(buf[3..5].try_into().unwrap()) as usize
    }

    #[test]
    fn record_length_matches_payload_after_build() {
        let ch = build_test_client_hello("example.com");
        assert_eq!(record_len(&ch), ch.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn split_keeps_all_lengths_consistent() {
        let ch = build_test_client_hello("example.com");
        let split_ch = split(&ch).unwrap();
        assert_eq!(split_ch.len(), ch.len() + 1);
        assert_eq!(record_len(&split_ch), split_ch.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn pad_reaches_target_length() {
        let ch = build_test_client_hello("example.com");
        let target = ch.len() + 50;
        let padded = pad(&ch, target).unwrap();
        assert_eq!(padded.len(), target);
        assert_eq!(record_len(&padded), padded.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn omit_removes_extension_and_fixes_lengths() {
        let ch = build_test_client_hello("example.com");
        let omitted = omit(&ch).unwrap();
        assert!(parse(&omitted).unwrap().sni_extension_offset.is_none());
        assert_eq!(record_len(&omitted), omitted.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn front_replaces_hostname_and_fixes_lengths() {
        let ch = build_test_client_hello("example.com");
        let fronted = front(&ch, "cdn.example.net").unwrap();
        assert_eq!(record_len(&fronted), fronted.len() - RECORD_HEADER_LEN);
        let s = String::from_utf8(fronted).unwrap();
        assert!(s.contains("cdn.example.net"));
    }
}

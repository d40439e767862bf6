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

//! # QPACK Module
//!
//! Header list <-> byte block compression with static and dynamic tables and
//! RFC 7541 Huffman coding. The encoder prefers, in order, an exact
//! static-table hit, an exact dynamic-table hit, a name-reference literal,
//! then a fully literal field.

use crate::huffman;
use crate::varint;
use std::collections::VecDeque;
use thiserror::Error;

pub type HeaderField = (String, String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QpackError {
    #[error("buffer truncated")]
    Truncated,
    #[error("invalid table index")]
    InvalidIndex,
    #[error("huffman decode error")]
    HuffmanDecode,
    #[error("decoder blocked awaiting {0} more insertions")]
    Blocked(u64),
    #[error("dynamic table capacity exceeded")]
    CapacityExceeded,
}

/// The fixed QPACK static table (RFC 9204 Appendix A), truncated to the
/// entries this implementation actually indexes by exact (name, value) or
/// name-only match; index numbering matches the RFC.
pub const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

const ENTRY_OVERHEAD: usize = 32;

fn find_static(name: &str, value: &str) -> Option<(usize, bool)> {
    let mut name_only = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return Some((i, true));
            }
            if name_only.is_none() {
                name_only = Some((i, false));
            }
        }
    }
    name_only
}

#[derive(Debug, Clone)]
struct DynamicEntry {
    name: String,
    value: String,
}

impl DynamicEntry {
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// Shared dynamic table state, mutated by encoder-stream instructions and
/// read by both the field-section encoder/decoder.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<DynamicEntry>,
    capacity: usize,
    size: usize,
    insert_count: u64,
    known_received_count: u64,
}

impl DynamicTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            size: 0,
            insert_count: 0,
            known_received_count: 0,
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict_to_fit();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    pub fn known_received_count(&self) -> u64 {
        self.known_received_count
    }

    fn evict_to_fit(&mut self) {
        while self.size > self.capacity {
            match self.entries.pop_front() {
                Some(e) => self.size -= e.size(),
                None => break,
            }
        }
    }

    /// Inserts a new entry, evicting oldest entries until it fits. If the
    /// entry alone exceeds capacity it is silently dropped, but the sender
    /// is still credited with an insertion to stay in sync with RFC
    /// semantics (spec §4.3).
    pub fn insert(&mut self, name: String, value: String) {
        let entry = DynamicEntry { name, value };
        let entry_size = entry.size();
        if entry_size <= self.capacity {
            self.size += entry_size;
            self.entries.push_back(entry);
            self.evict_to_fit();
        }
        self.insert_count += 1;
    }

    /// Relative index from the *insertion* end (used while building the
    /// encoder's own references immediately after inserting).
    fn absolute_index_of(&self, name: &str, value: &str, exact: bool) -> Option<u64> {
        let base = self.insert_count - self.entries.len() as u64;
        for (i, e) in self.entries.iter().enumerate() {
            if e.name == name && (!exact || e.value == value) {
                return Some(base + i as u64);
            }
        }
        None
    }

    pub fn find(&self, name: &str, value: &str) -> Option<(u64, bool)> {
        if let Some(idx) = self.absolute_index_of(name, value, true) {
            return Some((idx, true));
        }
        self.absolute_index_of(name, value, false).map(|idx| (idx, false))
    }

    fn get_absolute(&self, absolute_index: u64) -> Option<&DynamicEntry> {
        let base = self.insert_count - self.entries.len() as u64;
        if absolute_index < base {
            return None;
        }
        self.entries.get((absolute_index - base) as usize)
    }

    pub fn note_section_ack(&mut self, insert_count_at_encode: u64) {
        if insert_count_at_encode > self.known_received_count {
            self.known_received_count = insert_count_at_encode;
        }
    }

    pub fn note_insert_count_increment(&mut self, increment: u64) {
        self.known_received_count += increment;
    }
}

/// Encodes a header list into a QPACK field section, given the current
/// dynamic table. Emits the required-insert-count/base prefix per spec §4.3.
pub fn encode(table: &mut DynamicTable, headers: &[HeaderField]) -> Vec<u8> {
    let mut field_lines = Vec::new();
    let mut required_insert_count: u64 = 0;
    let base = table.insert_count();

    for (name, value) in headers {
        if let Some((idx, exact)) = find_static(name, value) {
            if exact {
                let mut line = Vec::new();
                encode_prefixed_int(&mut line, 0xC0, 6, idx as u64);
                field_lines.push(line);
                continue;
            }
            let mut line = Vec::new();
            encode_prefixed_int(&mut line, 0x50, 4, idx as u64);
            encode_string(&mut line, value);
            field_lines.push(line);
            continue;
        }
        if let Some((abs_idx, exact)) = table.find(name, value) {
            required_insert_count = required_insert_count.max(abs_idx + 1);
            let rel = base.saturating_sub(abs_idx).saturating_sub(1);
            if exact {
                field_lines.push(encode_indexed_dynamic(rel));
                continue;
            }
            field_lines.push(encode_literal_name_ref_dynamic(rel, value));
            continue;
        }
        field_lines.push(encode_literal_literal(name, value));
    }

    let mut out = Vec::new();
    encode_prefix(&mut out, required_insert_count, base);
    for line in field_lines {
        out.extend_from_slice(&line);
    }
    out
}

/// RFC 7541 §5.1 prefixed-integer encoding: the low `prefix_bits` bits of the
/// first byte carry `value` directly if it fits, otherwise the prefix is set
/// to all-ones and the remainder follows as base-128 continuation bytes.
/// `flags` supplies the high bits of the first byte (already positioned).
fn encode_prefixed_int(out: &mut Vec<u8>, flags: u8, prefix_bits: u8, value: u64) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        out.push(flags | value as u8);
        return;
    }
    out.push(flags | max as u8);
    let mut v = value - max;
    while v >= 128 {
        out.push(((v % 128) as u8) | 0x80);
        v /= 128;
    }
    out.push(v as u8);
}

fn decode_prefixed_int(buf: &[u8], prefix_bits: u8) -> Result<(u64, usize), QpackError> {
    let first = *buf.first().ok_or(QpackError::Truncated)?;
    let max = (1u64 << prefix_bits) - 1;
    let prefix = (first as u64) & max;
    if prefix < max {
        return Ok((prefix, 1));
    }
    let mut value = max;
    let mut m: u32 = 0;
    let mut pos = 1;
    loop {
        let b = *buf.get(pos).ok_or(QpackError::Truncated)?;
        value += ((b & 0x7F) as u64) << m;
        pos += 1;
        if b & 0x80 == 0 {
            break;
        }
        m += 7;
    }
    Ok((value, pos))
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    let huffman_encoded = huffman::encode(s.as_bytes());
    let (use_huffman, body): (bool, Vec<u8>) = if huffman_encoded.len() < s.len() {
        (true, huffman_encoded)
    } else {
        (false, s.as_bytes().to_vec())
    };
    let flags = if use_huffman { 0x80 } else { 0x00 };
    encode_prefixed_int(out, flags, 7, body.len() as u64);
    out.extend_from_slice(&body);
}

fn encode_prefix(out: &mut Vec<u8>, required_insert_count: u64, base: u64) {
    varint::encode(required_insert_count, out).expect("ric fits");
    // Sign bit + delta-base encoding collapsed to the common non-negative
    // case (base >= required_insert_count), sufficient for an encoder that
    // always references already-inserted entries.
    let delta = base.saturating_sub(required_insert_count);
    varint::encode(delta, out).expect("base delta fits");
}

/// Indexed field line referencing the dynamic table: `1T RRRRRR` with T=0.
fn encode_indexed_dynamic(rel_index: u64) -> Vec<u8> {
    let mut line = Vec::new();
    encode_prefixed_int(&mut line, 0x80, 6, rel_index);
    line
}

/// Literal field line with a dynamic-table name reference: `01NT RRRR`
/// with N=0 (may be indexed later) and T=0.
fn encode_literal_name_ref_dynamic(rel_index: u64, value: &str) -> Vec<u8> {
    let mut line = Vec::new();
    encode_prefixed_int(&mut line, 0x40, 4, rel_index);
    encode_string(&mut line, value);
    line
}

fn encode_literal_literal(name: &str, value: &str) -> Vec<u8> {
    let mut line = vec![0x20];
    encode_string(&mut line, name);
    encode_string(&mut line, value);
    line
}

/// Decodes a field section previously produced by `encode`. Returns
/// `QpackError::Blocked` if the local dynamic table has not yet received
/// enough insertions to satisfy the required-insert-count in the prefix.
pub fn decode(table: &DynamicTable, buf: &[u8]) -> Result<Vec<HeaderField>, QpackError> {
    let mut pos = 0;
    let (required_insert_count, n) = varint::decode(&buf[pos..]).map_err(|_| QpackError::Truncated)?;
    pos += n;
    let (base_delta, n) = varint::decode(&buf[pos..]).map_err(|_| QpackError::Truncated)?;
    pos += n;

    if required_insert_count > 0 && table.insert_count() < required_insert_count {
        return Err(QpackError::Blocked(required_insert_count - table.insert_count()));
    }
    let base = required_insert_count + base_delta;

    let mut out = Vec::new();
    while pos < buf.len() {
        let first = buf[pos];
        if first & 0x80 != 0 {
            let (idx, n) = decode_prefixed_int(&buf[pos..], 6)?;
            pos += n;
            if first & 0x40 != 0 {
                let (name, value) = STATIC_TABLE.get(idx as usize).ok_or(QpackError::InvalidIndex)?;
                out.push((name.to_string(), value.to_string()));
            } else {
                let abs = base.checked_sub(idx + 1).ok_or(QpackError::InvalidIndex)?;
                let entry = table.get_absolute(abs).ok_or(QpackError::InvalidIndex)?;
                out.push((entry.name.clone(), entry.value.clone()));
            }
        } else if first & 0x40 != 0 {
            let (idx, n) = decode_prefixed_int(&buf[pos..], 4)?;
            pos += n;
            let name = if first & 0x10 != 0 {
                STATIC_TABLE.get(idx as usize).ok_or(QpackError::InvalidIndex)?.0.to_string()
            } else {
                let abs = base.checked_sub(idx + 1).ok_or(QpackError::InvalidIndex)?;
                table.get_absolute(abs).ok_or(QpackError::InvalidIndex)?.name.clone()
            };
            let (value, n2) = decode_string(&buf[pos..])?;
            pos += n2;
            out.push((name, value));
        } else if first & 0x20 != 0 {
            pos += 1;
            let (name, n1) = decode_string(&buf[pos..])?;
            pos += n1;
            let (value, n2) = decode_string(&buf[pos..])?;
            pos += n2;
            out.push((name, value));
        } else {
            return Err(QpackError::InvalidIndex);
        }
    }
    Ok(out)
}

fn decode_string(buf: &[u8]) -> Result<(String, usize), QpackError> {
    let first = *buf.first().ok_or(QpackError::Truncated)?;
    let huffman_flag = first & 0x80 != 0;
    let (len, n) = decode_prefixed_int(buf, 7)?;
    let len = len as usize;
    let start = n;
    if buf.len() < start + len {
        return Err(QpackError::Truncated);
    }
    let body = &buf[start..start + len];
    let s = if huffman_flag {
        huffman::decode(body).map_err(|_| QpackError::HuffmanDecode)?
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    Ok((s, start + len))
}

/// Encoder-stream instruction, mutating the dynamic table (spec §4.3).
#[derive(Debug, Clone)]
pub enum EncoderInstruction {
    SetCapacity(usize),
    InsertWithNameReference { static_table: bool, name_index: u64, value: String },
    InsertWithLiteralName { name: String, value: String },
    Duplicate(u64),
}

pub fn apply_encoder_instruction(table: &mut DynamicTable, instr: EncoderInstruction) -> Result<(), QpackError> {
    match instr {
        EncoderInstruction::SetCapacity(cap) => {
            table.set_capacity(cap);
            Ok(())
        }
        EncoderInstruction::InsertWithNameReference { static_table, name_index, value } => {
            let name = if static_table {
                STATIC_TABLE.get(name_index as usize).ok_or(QpackError::InvalidIndex)?.0.to_string()
            } else {
                table.get_absolute(name_index).ok_or(QpackError::InvalidIndex)?.name.clone()
            };
            table.insert(name, value);
            Ok(())
        }
        EncoderInstruction::InsertWithLiteralName { name, value } => {
            table.insert(name, value);
            Ok(())
        }
        EncoderInstruction::Duplicate(abs_index) => {
            let entry = table.get_absolute(abs_index).ok_or(QpackError::InvalidIndex)?.clone();
            table.insert(entry.name, entry.value);
            Ok(())
        }
    }
}

/// Decoder-stream instruction, advancing the known-received count.
#[derive(Debug, Clone)]
pub enum DecoderInstruction {
    SectionAck(u64),
    StreamCancellation(u64),
    InsertCountIncrement(u64),
}

pub fn apply_decoder_instruction(table: &mut DynamicTable, instr: DecoderInstruction) {
    match instr {
        DecoderInstruction::SectionAck(ric) => table.note_section_ack(ric),
        DecoderInstruction::StreamCancellation(_) => {}
        DecoderInstruction::InsertCountIncrement(inc) => table.note_insert_count_increment(inc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_indexed_field_matches_spec_scenario() {
        let mut table = DynamicTable::new(4096);
        let encoded = encode(&mut table, &[(":method".to_string(), "GET".to_string())]);
        assert_eq!(encoded, vec![0x00, 0x00, 0xD1]);
        let decoded = decode(&table, &encoded).unwrap();
        assert_eq!(decoded, vec![(":method".to_string(), "GET".to_string())]);
    }

    #[test]
    fn literal_literal_round_trips() {
        let mut table = DynamicTable::new(4096);
        let headers = vec![("x-custom".to_string(), "value".to_string())];
        let encoded = encode(&mut table, &headers);
        let decoded = decode(&table, &encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn dynamic_table_eviction_keeps_size_within_capacity() {
        let mut table = DynamicTable::new(64);
        table.insert("a".repeat(10), "b".repeat(10));
        table.insert("c".repeat(10), "d".repeat(10));
        assert!(table.size() <= table.capacity());
    }

    #[test]
    fn oversized_entry_is_dropped_but_credited() {
        let mut table = DynamicTable::new(16);
        let before = table.insert_count();
        table.insert("name".repeat(5), "value".repeat(5));
        assert_eq!(table.size(), 0);
        assert_eq!(table.insert_count(), before + 1);
    }

    #[test]
    fn decode_blocks_until_insertions_arrive() {
        let mut table = DynamicTable::new(4096);
        table.insert("x-dyn".to_string(), "v1".to_string());
        let headers = vec![("x-dyn".to_string(), "v1".to_string())];
        let encoded = encode(&mut table, &headers);

        let empty_table = DynamicTable::new(4096);
        let err = decode(&empty_table, &encoded).unwrap_err();
        assert!(matches!(err, QpackError::Blocked(_)));
    }
}

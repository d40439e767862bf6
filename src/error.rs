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

//! # Error Module
//!
//! Error kinds are grouped by category rather than by originating module, so
//! that callers can match on "what kind of thing went wrong" without caring
//! which subsystem raised it. Connection-fatal categories are marked as such
//! in their doc comments; the connection core is the only place that acts on
//! that distinction (see `connection::Connection::close`).

use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    Reset,
    #[error("operation timed out")]
    Timeout,
    #[error("socket unavailable: {0}")]
    SocketUnavailable(String),
    #[error("DNS resolution failed: {0}")]
    DnsFail(String),
    #[error("path MTU blackhole detected")]
    MtuBlackhole,
    #[error("packet too large for current MTU")]
    PacketTooLarge,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("certificate error: {0}")]
    CertificateError(String),
    #[error("AEAD authentication failure")]
    AuthFail,
    #[error("key derivation failed")]
    KeyDerivationFail,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid state for requested operation")]
    InvalidState,
    #[error("frame error: {0}")]
    FrameError(String),
    #[error("stream error on stream {0}")]
    StreamError(u64),
    #[error("flow control violation")]
    FlowControlViolation,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("qpack decode error: {0}")]
    QpackDecode(String),
    #[error("qpack decoder blocked")]
    QpackBlocked,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("missing option: {0}")]
    MissingOption(String),
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// Panic-equivalent: an invariant the core relies on no longer holds.
    /// Surfaces as a connection-fatal error rather than aborting the process.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuicFuscateError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl QuicFuscateError {
    /// Connection-fatal errors close the connection and fail every pending
    /// operation with the originating error (spec §7 propagation policy).
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            QuicFuscateError::Crypto(CryptoError::AuthFail)
                | QuicFuscateError::Internal(InternalError::InvariantViolation(_))
                | QuicFuscateError::Protocol(ProtocolError::TransportError(_))
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            QuicFuscateError::Network(_) => "network",
            QuicFuscateError::Crypto(_) => "crypto",
            QuicFuscateError::Protocol(_) => "protocol",
            QuicFuscateError::Config(_) => "config",
            QuicFuscateError::Runtime(_) => "runtime",
            QuicFuscateError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, QuicFuscateError>;

/// One diagnostic record per error, kept by a per-connection `ErrorReporter`
/// rather than a process-wide singleton (spec §9, "Global singletons").
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub category: &'static str,
    pub message: String,
    pub connection_id: Option<u64>,
    pub stream_id: Option<u64>,
    pub timestamp: SystemTime,
}

/// Records errors for diagnostics without affecting control flow. One
/// instance per connection (or per runtime for configuration-stage errors
/// that precede any connection).
#[derive(Debug, Default)]
pub struct ErrorReporter {
    records: Vec<ErrorRecord>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    pub fn report(&mut self, err: &QuicFuscateError, connection_id: Option<u64>, stream_id: Option<u64>) {
        log::error!("[{}] {}", err.category(), err);
        self.records.push(ErrorRecord {
            category: err.category(),
            message: err.to_string(),
            connection_id,
            stream_id,
            timestamp: SystemTime::now(),
        });
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_fail_is_connection_fatal() {
        let err: QuicFuscateError = CryptoError::AuthFail.into();
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn out_of_range_is_not_connection_fatal() {
        let err: QuicFuscateError = ConfigError::OutOfRange("mtu.min".into()).into();
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn reporter_records_category_and_message() {
        let mut reporter = ErrorReporter::new();
        let err: QuicFuscateError = NetworkError::Timeout.into();
        reporter.report(&err, Some(7), None);
        assert_eq!(reporter.records().len(), 1);
        assert_eq!(reporter.records()[0].category, "network");
        assert_eq!(reporter.records()[0].connection_id, Some(7));
    }
}

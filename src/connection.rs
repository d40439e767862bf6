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

//! # Connection Core
//!
//! Owns the socket, AEAD selector, masquerading pipeline, MTU manager,
//! BBRv2 controller, migration controller, and FEC engine for one
//! connection. Per spec §5 this task is logically single-threaded
//! cooperative: every public method runs to a suspension point (UDP I/O,
//! a timer) without yielding the connection's mutable state to anyone else.
//!
//! The QUIC/TLS engine itself is an external collaborator behind
//! [`TlsEngine`] and [`DatagramIo`]; this module never reaches into a
//! specific handshake or socket library directly, so swapping either stays
//! a trait-implementation concern.

use crate::bbr::{AckEvent, BbrController};
use crate::crypto::CipherSuiteSelector;
use crate::error::{ErrorReporter, NetworkError, ProtocolError, QuicFuscateError, Result};
use crate::fec::AdaptiveFec;
use crate::fingerprint::FingerprintProfile;
use crate::fronting::DomainFronter;
use crate::masquerade::MasqueradePipeline;
use crate::migration::MigrationController;
use crate::mtu::{Direction, PathMtuManager};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);
const DATAGRAM_TAG: u8 = 0xff;

/// Session keys exported once the TLS handshake completes. Directionality
/// matches TLS 1.3: the client encrypts with `client_*`, decrypts with
/// `server_*`.
#[derive(Clone)]
pub struct TrafficKeys {
    pub client_key: Vec<u8>,
    pub client_iv: Vec<u8>,
    pub server_key: Vec<u8>,
    pub server_iv: Vec<u8>,
}

/// The handshake/record-layer collaborator (spec Open Question 4: the
/// TLS/QUIC engine boundary is external). A production build backs this
/// with a real TLS 1.3 implementation; tests back it with a fixed-key stub.
pub trait TlsEngine: Send {
    fn build_client_hello(&mut self, profile: &FingerprintProfile, sni: &str) -> Vec<u8>;
    fn consume_server_flight(&mut self, data: &[u8]) -> Result<()>;
    fn is_established(&self) -> bool;
    fn export_traffic_keys(&self) -> Result<TrafficKeys>;
}

/// The UDP transport collaborator. Implemented for [`tokio::net::UdpSocket`]
/// directly; mocked in tests with an in-memory channel pair.
pub trait DatagramIo: Send {
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
    fn try_send_to(&mut self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize>;
    fn try_recv_from(&mut self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

impl DatagramIo for tokio::net::UdpSocket {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }

    fn try_send_to(&mut self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        tokio::net::UdpSocket::try_send_to(self, buf, target)
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::try_recv_from(self, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

#[derive(Default)]
struct StreamBuffers {
    recv: Vec<u8>,
    local_fin: bool,
    remote_fin: bool,
}

/// Builds a TLS-1.3-style per-record nonce: the fixed IV XORed with the
/// big-endian packet number in its low-order bytes (RFC 9001 §5.3).
fn packet_nonce(iv: &[u8], packet_number: u64) -> Vec<u8> {
    let mut nonce = iv.to_vec();
    let pn_bytes = packet_number.to_be_bytes();
    let offset = nonce.len().saturating_sub(pn_bytes.len());
    for (i, b) in pn_bytes.iter().enumerate() {
        nonce[offset + i] ^= b;
    }
    nonce
}

/// Holds everything spec §4.12 assigns to the connection core: quic/tls
/// state via the collaborators above, the AEAD selector, the masquerading
/// pipeline, the MTU manager, the BBRv2 controller, the migration
/// controller, and the FEC engine.
pub struct Connection<IO: DatagramIo, T: TlsEngine> {
    io: IO,
    tls: T,
    state: ConnectionState,
    peer_addr: SocketAddr,
    cipher: Option<CipherSuiteSelector>,
    keys: Option<TrafficKeys>,
    send_packet_number: u64,
    recv_packet_number_floor: u64,
    masquerade: MasqueradePipeline,
    mtu: PathMtuManager,
    bbr: BbrController,
    migration: MigrationController,
    fec: Option<AdaptiveFec>,
    real_host: String,
    next_stream_id: u64,
    streams: HashMap<u64, StreamBuffers>,
    errors: ErrorReporter,
}

impl<IO: DatagramIo, T: TlsEngine> Connection<IO, T> {
    /// Performs the handshake over `io` against `peer_addr`, then wires up
    /// the MTU manager, BBRv2 controller, and migration controller. The mtu
    /// bounds feed both the controller's cwnd floor and the manager itself.
    pub async fn connect(
        mut io: IO,
        mut tls: T,
        peer_addr: SocketAddr,
        real_host: String,
        sni: String,
        profile: FingerprintProfile,
        fronter: Option<DomainFronter>,
        dynamic_table_capacity: usize,
        mtu_min: u16,
        mtu_max: u16,
        mtu_step: u16,
        mtu_blackhole_threshold: u8,
    ) -> Result<Self> {
        let hello = tls.build_client_hello(&profile, &sni);
        io.try_send_to(&hello, peer_addr)
            .map_err(|_| QuicFuscateError::Network(NetworkError::ConnectionRefused))?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut buf = [0u8; 65536];
        loop {
            match io.try_recv_from(&mut buf) {
                Ok((n, from)) if from == peer_addr => {
                    tls.consume_server_flight(&buf[..n])?;
                    if tls.is_established() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(QuicFuscateError::Network(NetworkError::Timeout));
                    }
                    sleep(HANDSHAKE_POLL_INTERVAL).await;
                }
                Err(_) => return Err(QuicFuscateError::Network(NetworkError::Reset)),
            }
        }

        let keys = tls.export_traffic_keys()?;
        let mtu = PathMtuManager::new(mtu_min, mtu_max, mtu_step, mtu_blackhole_threshold)?;
        let mut conn = Self {
            io,
            tls,
            state: ConnectionState::Established,
            peer_addr,
            cipher: Some(CipherSuiteSelector::new()),
            keys: Some(keys),
            send_packet_number: 0,
            recv_packet_number_floor: 0,
            masquerade: MasqueradePipeline::new(profile, fronter, dynamic_table_capacity),
            mtu,
            bbr: BbrController::new(mtu_min as u64),
            migration: MigrationController::new(peer_addr),
            fec: None,
            real_host,
            next_stream_id: 0,
            streams: HashMap::new(),
            errors: ErrorReporter::new(),
        };
        conn.mtu.enable(Instant::now());
        Ok(conn)
    }

    pub fn enable_fec(&mut self, fec: AdaptiveFec) {
        self.fec = Some(fec);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Allocates the next client-initiated bidirectional stream id (low two
    /// bits `00`, per RFC 9000 §2.1).
    pub fn open_stream(&mut self) -> u64 {
        let id = self.next_stream_id;
        self.next_stream_id += 4;
        self.streams.insert(id, StreamBuffers::default());
        id
    }

    fn encrypt_for_send(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(QuicFuscateError::Protocol(ProtocolError::InvalidState))?;
        let keys = self.keys.as_ref().ok_or(QuicFuscateError::Protocol(ProtocolError::InvalidState))?;
        let nonce = packet_nonce(&keys.client_iv, self.send_packet_number);
        self.send_packet_number += 1;
        cipher.encrypt(&keys.client_key, &nonce, &[], plaintext)
    }

    fn decrypt_received(&self, packet_number: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(QuicFuscateError::Protocol(ProtocolError::InvalidState))?;
        let keys = self.keys.as_ref().ok_or(QuicFuscateError::Protocol(ProtocolError::InvalidState))?;
        let nonce = packet_nonce(&keys.server_iv, packet_number);
        cipher.decrypt(&keys.server_key, &nonce, &[], ciphertext)
    }

    /// Writes `bytes` to `stream_id`, framing through the masquerading
    /// pipeline and sealing with the AEAD selector before the UDP send.
    pub async fn write(&mut self, stream_id: u64, bytes: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(QuicFuscateError::Protocol(ProtocolError::InvalidState));
        }
        if !self.streams.contains_key(&stream_id) {
            return Err(QuicFuscateError::Protocol(ProtocolError::StreamError(stream_id)));
        }
        let path = format!("/{}", stream_id);
        let framed = self.masquerade.wrap_outbound(stream_id, &self.real_host, &path, bytes)?;
        let mut tagged = Vec::with_capacity(framed.len() + 1);
        tagged.push(stream_id as u8);
        tagged.extend_from_slice(&framed);
        let sealed = self.encrypt_for_send(&tagged)?;
        self.send_sized(&sealed).await
    }

    async fn send_sized(&mut self, sealed: &[u8]) -> Result<()> {
        let limit = self.mtu.current_mtu(Direction::Outgoing) as usize;
        if sealed.len() > limit {
            return Err(QuicFuscateError::Network(NetworkError::PacketTooLarge));
        }
        self.io
            .try_send_to(sealed, self.peer_addr)
            .map_err(|_| QuicFuscateError::Network(NetworkError::Reset))?;
        Ok(())
    }

    /// Blocks (cooperatively) until at least one byte of application data
    /// has arrived for `stream_id`, returning and draining the stream's
    /// receive buffer.
    pub async fn read(&mut self, stream_id: u64) -> Result<Vec<u8>> {
        if !self.streams.contains_key(&stream_id) {
            return Err(QuicFuscateError::Protocol(ProtocolError::StreamError(stream_id)));
        }
        loop {
            if let Some(buf) = self.streams.get_mut(&stream_id) {
                if !buf.recv.is_empty() {
                    return Ok(std::mem::take(&mut buf.recv));
                }
                if buf.remote_fin {
                    return Ok(Vec::new());
                }
            }
            self.poll_once().await?;
        }
    }

    /// Pulls and processes one inbound datagram if available, feeding
    /// decoded stream effects, BBRv2 ack telemetry, and MTU probe results.
    /// Non-blocking: returns immediately if nothing is pending. A
    /// connection-fatal error (spec §7) closes the connection before
    /// propagating to the caller.
    pub async fn poll_once(&mut self) -> Result<()> {
        let result = self.poll_once_inner().await;
        if let Err(e) = &result {
            self.errors.report(e, None, None);
            if e.is_connection_fatal() {
                self.state = ConnectionState::Closed;
            }
        }
        result
    }

    async fn poll_once_inner(&mut self) -> Result<()> {
        let mut buf = [0u8; 65536];
        match self.io.try_recv_from(&mut buf) {
            Ok((n, from)) if from == self.peer_addr => {
                let packet_number = self.recv_packet_number_floor;
                self.recv_packet_number_floor += 1;
                let plaintext = self.decrypt_received(packet_number, &buf[..n])?;
                if plaintext.first() == Some(&DATAGRAM_TAG) {
                    return Ok(());
                }
                self.dispatch_inbound(&plaintext)?;
                let now = Instant::now();
                self.bbr.update(AckEvent {
                    rtt_us: 0,
                    delivered_bytes: n as u64,
                    delivered_duration_us: 0,
                    bytes_in_flight: 0,
                    bytes_lost: 0,
                    now_us: now.elapsed().as_micros() as u64,
                });
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                sleep(READ_POLL_INTERVAL).await;
                Ok(())
            }
            Err(_) => Err(QuicFuscateError::Network(NetworkError::Reset)),
        }
    }

    pub fn error_log(&self) -> &[crate::error::ErrorRecord] {
        self.errors.records()
    }

    fn dispatch_inbound(&mut self, plaintext: &[u8]) -> Result<()> {
        // First byte: stream id as a single varint-free byte for the simple
        // framing used between the record layer and per-stream buffers; a
        // production wire format would carry a full QUIC STREAM frame here.
        if plaintext.is_empty() {
            return Ok(());
        }
        let stream_id = plaintext[0] as u64;
        let effect = self.masquerade.process_inbound(stream_id, &plaintext[1..])?;
        let buf = self.streams.entry(stream_id).or_insert_with(StreamBuffers::default);
        buf.recv.extend_from_slice(&effect.data);
        Ok(())
    }

    /// Sends an unreliable datagram (QUIC DATAGRAM frame equivalent),
    /// bypassing stream framing and the masquerading pipeline entirely.
    pub async fn send_datagram(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(QuicFuscateError::Protocol(ProtocolError::InvalidState));
        }
        let mut tagged = Vec::with_capacity(bytes.len() + 1);
        tagged.push(DATAGRAM_TAG);
        tagged.extend_from_slice(bytes);
        let sealed = self.encrypt_for_send(&tagged)?;
        self.send_sized(&sealed).await
    }

    pub fn migration_controller_mut(&mut self) -> &mut MigrationController {
        &mut self.migration
    }

    pub fn mtu_manager(&self) -> &PathMtuManager {
        &self.mtu
    }

    pub fn bbr_controller(&self) -> &BbrController {
        &self.bbr
    }

    /// Marks the connection closed; `reason` is diagnostic only, nothing is
    /// sent on the wire beyond the final FIN bookkeeping.
    pub async fn close(&mut self, reason: &str) -> Result<()> {
        log::info!("closing connection to {}: {}", self.peer_addr, reason);
        for id in self.streams.keys().copied().collect::<Vec<_>>() {
            self.masquerade.note_local_fin(id);
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{BrowserProfile, OsProfile};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct LoopbackIo {
        inbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
        outbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
        local: SocketAddr,
    }

    impl DatagramIo for LoopbackIo {
        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(self.local)
        }

        fn try_send_to(&mut self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            self.outbox.lock().unwrap().push_back((buf.to_vec(), target));
            Ok(buf.len())
        }

        fn try_recv_from(&mut self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            let mut inbox = self.inbox.lock().unwrap();
            if let Some((data, from)) = inbox.pop_front() {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
            }
        }
    }

    struct StubTls {
        established: bool,
    }

    impl TlsEngine for StubTls {
        fn build_client_hello(&mut self, _profile: &FingerprintProfile, _sni: &str) -> Vec<u8> {
            vec![0x01]
        }
        fn consume_server_flight(&mut self, _data: &[u8]) -> Result<()> {
            self.established = true;
            Ok(())
        }
        fn is_established(&self) -> bool {
            self.established
        }
        fn export_traffic_keys(&self) -> Result<TrafficKeys> {
            Ok(TrafficKeys {
                client_key: vec![0u8; 16],
                client_iv: vec![0u8; 16],
                server_key: vec![0u8; 16],
                server_iv: vec![0u8; 16],
            })
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn connect_completes_handshake_over_loopback_io() {
        let peer = addr(2);
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        inbox.lock().unwrap().push_back((vec![0x02], peer));
        let io = LoopbackIo { inbox, outbox: Arc::new(Mutex::new(VecDeque::new())), local: addr(1) };
        let tls = StubTls { established: false };
        let profile = FingerprintProfile::new(BrowserProfile::Chrome, OsProfile::Linux);

        let conn = Connection::connect(io, tls, peer, "example.com".into(), "example.com".into(), profile, None, 4096, 1200, 1500, 10, 3)
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[tokio::test]
    async fn open_stream_allocates_client_bidi_ids() {
        let peer = addr(2);
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        inbox.lock().unwrap().push_back((vec![0x02], peer));
        let io = LoopbackIo { inbox, outbox: Arc::new(Mutex::new(VecDeque::new())), local: addr(1) };
        let tls = StubTls { established: false };
        let profile = FingerprintProfile::new(BrowserProfile::Firefox, OsProfile::Linux);
        let mut conn = Connection::connect(io, tls, peer, "example.com".into(), "example.com".into(), profile, None, 4096, 1200, 1500, 10, 3)
            .await
            .unwrap();

        let a = conn.open_stream();
        let b = conn.open_stream();
        assert_eq!(a % 4, 0);
        assert_eq!(b, a + 4);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_loopback() {
        let peer = addr(2);
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        inbox.lock().unwrap().push_back((vec![0x02], peer));
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let io = LoopbackIo { inbox: inbox.clone(), outbox: outbox.clone(), local: addr(1) };
        let tls = StubTls { established: false };
        let profile = FingerprintProfile::new(BrowserProfile::Chrome, OsProfile::Windows);
        let mut conn = Connection::connect(io, tls, peer, "example.com".into(), "example.com".into(), profile, None, 4096, 1200, 1500, 10, 3)
            .await
            .unwrap();

        let stream = conn.open_stream();
        conn.write(stream, b"hello").await.unwrap();

        // Loop the just-sent sealed packet straight back so read() observes it.
        // StubTls hands out identical client/server keys, so the same
        // connection can decrypt its own outbound packet for this test.
        let sent = outbox.lock().unwrap().pop_front().unwrap();
        inbox.lock().unwrap().push_back((sent.0, peer));

        let received = conn.read(stream).await.unwrap();
        assert_eq!(received, b"hello".to_vec());
    }
}

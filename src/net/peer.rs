//! Peer connections, handshake and lifecycle.
//!
//! One reader thread per peer (owned by the node); writes go through a
//! mutex on the stream. Peers accumulate failure and stall counters and
//! are banned by IP once they exceed the thresholds.

use std::collections::HashMap;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::constants::{
    BAN_DURATION_SECS, HANDSHAKE_TIMEOUT_SEC, MAX_PEERS, MAX_PEER_FAILURES, PROTOCOL_VERSION,
};
use crate::core::crypto::random_nonce;
use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::now_ms;
use crate::net::messages::{NetMessage, VersionMsg};
use crate::net::protocol::{read_frame, write_frame};

/// Peer connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Ready,
    Disconnected,
}

/// Remote identity learned during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub best_height: u64,
    pub nonce: u64,
}

/// A connected peer. Shared between the manager, the reader thread and
/// the sync manager.
pub struct Peer {
    pub addr: SocketAddr,
    pub outbound: bool,
    stream: Mutex<TcpStream>,
    state: RwLock<PeerState>,
    info: RwLock<Option<PeerInfo>>,
    pub last_send_ms: AtomicU64,
    pub last_recv_ms: AtomicU64,
    pub failures: AtomicU32,
    pub stall_count: AtomicU32,
    pub latency_ms: AtomicU64,
    pending_ping: Mutex<Option<(u64, u64)>>,
}

impl Peer {
    fn new(stream: TcpStream, addr: SocketAddr, outbound: bool) -> Self {
        let now = now_ms();
        Peer {
            addr,
            outbound,
            stream: Mutex::new(stream),
            state: RwLock::new(PeerState::Handshaking),
            info: RwLock::new(None),
            last_send_ms: AtomicU64::new(now),
            last_recv_ms: AtomicU64::new(now),
            failures: AtomicU32::new(0),
            stall_count: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            pending_ping: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write().unwrap() = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    pub fn info(&self) -> Option<PeerInfo> {
        self.info.read().unwrap().clone()
    }

    pub fn best_height(&self) -> u64 {
        self.info
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.best_height)
            .unwrap_or(0)
    }

    /// Raise the peer's known best height when its blocks prove it.
    pub fn observe_height(&self, height: u64) {
        let mut info = self.info.write().unwrap();
        if let Some(info) = info.as_mut() {
            if height > info.best_height {
                info.best_height = height;
            }
        }
    }

    pub fn send(&self, msg: &NetMessage) -> MontanaResult<()> {
        let mut stream = self.stream.lock().unwrap();
        write_frame(&mut *stream, msg.message_type(), &msg.payload())?;
        self.last_send_ms.store(now_ms(), Ordering::Relaxed);
        Ok(())
    }

    pub fn record_recv(&self) {
        self.last_recv_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_stall(&self) -> u32 {
        self.stall_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn begin_ping(&self) -> MontanaResult<u64> {
        let nonce = random_nonce();
        *self.pending_ping.lock().unwrap() = Some((nonce, now_ms()));
        self.send(&NetMessage::Ping(nonce))?;
        Ok(nonce)
    }

    /// Complete an outstanding ping; returns the measured latency.
    pub fn complete_ping(&self, nonce: u64) -> Option<u64> {
        let mut pending = self.pending_ping.lock().unwrap();
        match pending.take() {
            Some((expected, sent_ms)) if expected == nonce => {
                let latency = now_ms().saturating_sub(sent_ms);
                self.latency_ms.store(latency, Ordering::Relaxed);
                Some(latency)
            }
            other => {
                *pending = other;
                None
            }
        }
    }

    /// Clone the stream for the dedicated reader thread.
    pub fn reader_stream(&self) -> MontanaResult<TcpStream> {
        Ok(self.stream.lock().unwrap().try_clone()?)
    }

    pub fn disconnect(&self) {
        self.set_state(PeerState::Disconnected);
        let stream = self.stream.lock().unwrap();
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Connection registry, handshake driver and ban list.
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    banned: Mutex<HashMap<IpAddr, u64>>,
    pub local_nonce: u64,
    services: u64,
    user_agent: String,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(services: u64, user_agent: String) -> Self {
        PeerManager {
            peers: RwLock::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            local_nonce: random_nonce(),
            services,
            user_agent,
            max_peers: MAX_PEERS,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(addr).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_ready())
            .cloned()
            .collect()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let mut banned = self.banned.lock().unwrap();
        let now = now_ms();
        banned.retain(|_, until| *until > now);
        banned.contains_key(ip)
    }

    pub fn ban(&self, ip: IpAddr, duration_secs: u64) {
        warn!("banning {} for {}s", ip, duration_secs);
        self.banned
            .lock()
            .unwrap()
            .insert(ip, now_ms() + duration_secs * 1000);
        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .unwrap()
            .values()
            .filter(|p| p.addr.ip() == ip)
            .cloned()
            .collect();
        for peer in peers {
            self.disconnect(&peer.addr);
        }
    }

    /// Record a fault against a peer; bans it once it crosses the
    /// failure threshold.
    pub fn punish(&self, peer: &Peer) {
        let failures = peer.record_failure();
        debug!("peer {} failure count {}", peer.addr, failures);
        if failures >= MAX_PEER_FAILURES {
            self.ban(peer.addr.ip(), BAN_DURATION_SECS);
        }
    }

    /// Open an outbound connection and run the handshake.
    pub fn connect(&self, addr: SocketAddr, best_height: u64) -> MontanaResult<Arc<Peer>> {
        if self.is_banned(&addr.ip()) {
            return Err(MontanaError::PeerBanned);
        }
        if self.get(&addr).is_some() {
            return Err(MontanaError::ProtocolViolation("already connected"));
        }
        if self.peer_count() >= self.max_peers {
            return Err(MontanaError::ProtocolViolation("peer limit reached"));
        }

        let stream = TcpStream::connect_timeout(
            &addr,
            Duration::from_secs(HANDSHAKE_TIMEOUT_SEC),
        )?;
        self.setup_and_handshake(stream, addr, true, best_height)
    }

    /// Adopt an accepted inbound connection and run the handshake.
    pub fn accept(&self, stream: TcpStream, best_height: u64) -> MontanaResult<Arc<Peer>> {
        let addr = stream.peer_addr()?;
        if self.is_banned(&addr.ip()) {
            return Err(MontanaError::PeerBanned);
        }
        if self.peer_count() >= self.max_peers {
            return Err(MontanaError::ProtocolViolation("peer limit reached"));
        }
        self.setup_and_handshake(stream, addr, false, best_height)
    }

    fn setup_and_handshake(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
        best_height: u64,
    ) -> MontanaResult<Arc<Peer>> {
        stream.set_read_timeout(Some(Duration::from_secs(HANDSHAKE_TIMEOUT_SEC)))?;
        stream.set_write_timeout(Some(Duration::from_secs(HANDSHAKE_TIMEOUT_SEC)))?;
        stream.set_nodelay(true)?;

        let peer = Arc::new(Peer::new(stream, addr, outbound));
        match self.handshake(&peer, best_height) {
            Ok(info) => {
                *peer.info.write().unwrap() = Some(info);
                peer.set_state(PeerState::Ready);
                // Reader threads poll with a short timeout so shutdown is
                // observed promptly.
                peer.stream
                    .lock()
                    .unwrap()
                    .set_read_timeout(Some(Duration::from_secs(1)))?;
                self.peers.write().unwrap().insert(addr, peer.clone());
                info!(
                    "peer ready: {} ({}) height {}",
                    addr,
                    if outbound { "outbound" } else { "inbound" },
                    peer.best_height()
                );
                Ok(peer)
            }
            Err(e) => {
                peer.disconnect();
                Err(e)
            }
        }
    }

    fn local_version(&self, best_height: u64) -> NetMessage {
        NetMessage::Version(VersionMsg {
            version: PROTOCOL_VERSION,
            services: self.services,
            timestamp_ms: now_ms(),
            nonce: self.local_nonce,
            user_agent: self.user_agent.clone(),
            best_height,
        })
    }

    fn read_message(&self, peer: &Peer) -> MontanaResult<NetMessage> {
        let mut stream = peer.reader_stream()?;
        let (ty, payload) = read_frame(&mut stream)?;
        Ok(NetMessage::decode(ty, &payload)?)
    }

    /// Version/verack exchange. Outbound speaks first; inbound answers.
    fn handshake(&self, peer: &Peer, best_height: u64) -> MontanaResult<PeerInfo> {
        let remote = if peer.outbound {
            peer.send(&self.local_version(best_height))?;
            let remote = self.expect_version(peer)?;
            peer.send(&NetMessage::Verack)?;
            self.expect_verack(peer)?;
            remote
        } else {
            let remote = self.expect_version(peer)?;
            peer.send(&self.local_version(best_height))?;
            peer.send(&NetMessage::Verack)?;
            self.expect_verack(peer)?;
            remote
        };

        Ok(PeerInfo {
            version: remote.version,
            services: remote.services,
            user_agent: remote.user_agent,
            best_height: remote.best_height,
            nonce: remote.nonce,
        })
    }

    fn expect_version(&self, peer: &Peer) -> MontanaResult<VersionMsg> {
        match self.read_message(peer)? {
            NetMessage::Version(version) => {
                if version.nonce == self.local_nonce {
                    return Err(MontanaError::SelfConnection);
                }
                if version.version < PROTOCOL_VERSION {
                    return Err(MontanaError::VersionTooOld(version.version));
                }
                Ok(version)
            }
            _ => Err(MontanaError::ProtocolViolation("expected version")),
        }
    }

    fn expect_verack(&self, peer: &Peer) -> MontanaResult<()> {
        match self.read_message(peer)? {
            NetMessage::Verack => Ok(()),
            _ => Err(MontanaError::ProtocolViolation("expected verack")),
        }
    }

    pub fn disconnect(&self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.write().unwrap().remove(addr) {
            peer.disconnect();
            info!("peer disconnected: {}", addr);
        }
    }

    pub fn disconnect_all(&self) {
        let addrs: Vec<SocketAddr> = self.peers.read().unwrap().keys().copied().collect();
        for addr in addrs {
            self.disconnect(&addr);
        }
    }

    /// Send to every ready peer; peers that fail the write are dropped.
    pub fn broadcast(&self, msg: &NetMessage) {
        let mut failed = Vec::new();
        for peer in self.ready_peers() {
            if peer.send(msg).is_err() {
                failed.push(peer.addr);
            }
        }
        for addr in failed {
            self.disconnect(&addr);
        }
    }
}

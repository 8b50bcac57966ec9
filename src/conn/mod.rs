//! Connection manager (C5 — spec §4.5).
//!
//! One [`PeerConn`] per remote node: socket state machine, the auth
//! handshake sub-state, a tie-break rule for simultaneous-connect races,
//! a three-ping speed probe classifying the link fast/slow, and idle-fd
//! eviction via an LRU. Generalises the teacher's `Sender`/`Receiver`
//! wrapper-struct idiom (`message_types.rs`) from "one open NFS mount
//! socket" to "many peers, each independently reconnecting".

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::sync::Cache;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{ReconcileError, Result};

/// Socket-level connection state (spec §4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    None,
    Connecting,
    Active,
    Established,
    Passive,
}

/// Authentication handshake sub-state (spec §4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthState {
    None,
    Q1,
    Stage1,
    Q3,
    Finished,
}

/// Above this total round-trip (summed over all probe pings), or if any
/// single ping exceeds [`SLOW_SINGLE_RTT_THRESHOLD`], a link is classified
/// "slow" (spec §4.5 speed probe — three 16-byte-payload pings).
const FAST_LINK_THRESHOLD: Duration = Duration::from_millis(40);
const SLOW_SINGLE_RTT_THRESHOLD: Duration = Duration::from_secs(1);
const SPEED_PROBE_PINGS: usize = 3;
const SPEED_PROBE_PAYLOAD_LEN: usize = 16;

/// Flat viscosity delay applied after every failed connect attempt (spec
/// §4.5 "connect throttling" — not exponential, a constant wait).
const RECONNECT_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkSpeed {
    Fast,
    Slow,
}

/// Per-peer connection state, guarded by an async mutex since the
/// connect/auth handshake spans multiple awaits.
pub struct PeerConn {
    pub node_id: u32,
    pub addr: SocketAddr,
    pub conn_state: ConnState,
    pub auth_state: AuthState,
    pub speed: Option<LinkSpeed>,
    pub stream: Option<TcpStream>,
    last_activity: Instant,
}

impl PeerConn {
    fn new(node_id: u32, addr: SocketAddr) -> Self {
        PeerConn { node_id, addr, conn_state: ConnState::None, auth_state: AuthState::None, speed: None, stream: None, last_activity: Instant::now() }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Tracks whether a peer has a failed connect attempt outstanding, so a
/// retry can be throttled by a flat delay (spec §4.5 "back off reconnect
/// attempts" rule).
struct Backoff {
    attempts: AtomicU32,
}

/// The connection manager: one instance per daemon, shared across tasks.
pub struct ConnectionManager {
    peers: DashMap<u32, Arc<Mutex<PeerConn>>>,
    backoffs: DashMap<u32, Backoff>,
    /// LRU of recently-active peer ids, used to decide which idle sockets
    /// to close first when an fd budget is hit (spec §4.5).
    idle_lru: Cache<u32, ()>,
    self_node_id: u32,
}

impl ConnectionManager {
    pub fn new(self_node_id: u32, max_open_sockets: u64) -> Self {
        ConnectionManager {
            peers: DashMap::new(),
            backoffs: DashMap::new(),
            idle_lru: Cache::new(max_open_sockets),
            self_node_id,
        }
    }

    pub fn peer(&self, node_id: u32, addr: SocketAddr) -> Arc<Mutex<PeerConn>> {
        self.peers.entry(node_id).or_insert_with(|| Arc::new(Mutex::new(PeerConn::new(node_id, addr)))).clone()
    }

    /// Decide who initiates when both sides race to connect: the node
    /// with the lower id wins and stays `Connecting`; the other yields to
    /// `Passive` and waits for the incoming side (spec §4.5 tie-break).
    pub fn tie_break(&self, peer_node_id: u32) -> ConnState {
        if self.self_node_id < peer_node_id {
            ConnState::Connecting
        } else {
            ConnState::Passive
        }
    }

    /// Viscosity delay before the next connect attempt: a flat 15s after
    /// every failure (spec §4.5 "connect throttling").
    pub fn next_backoff(&self, node_id: u32) -> Duration {
        let entry = self.backoffs.entry(node_id).or_insert_with(|| Backoff { attempts: AtomicU32::new(0) });
        entry.attempts.fetch_add(1, Ordering::Relaxed);
        RECONNECT_BACKOFF
    }

    pub fn reset_backoff(&self, node_id: u32) {
        if let Some(entry) = self.backoffs.get(&node_id) {
            entry.attempts.store(0, Ordering::Relaxed);
        }
    }

    /// Connect to `addr`, advancing through `Connecting` → `Active`.
    /// Caller drives the subsequent auth handshake separately.
    pub async fn connect(&self, node_id: u32, addr: SocketAddr) -> Result<()> {
        let peer = self.peer(node_id, addr);
        let mut guard = peer.lock().await;
        guard.conn_state = ConnState::Connecting;
        let stream = TcpStream::connect(addr).await.map_err(|_| ReconcileError::CouldNotConnect)?;
        guard.stream = Some(stream);
        guard.conn_state = ConnState::Active;
        guard.touch();
        drop(guard);
        self.idle_lru.insert(node_id, ());
        self.reset_backoff(node_id);
        Ok(())
    }

    pub async fn mark_established(&self, node_id: u32) {
        if let Some(peer) = self.peers.get(&node_id) {
            let mut guard = peer.lock().await;
            guard.conn_state = ConnState::Established;
            guard.auth_state = AuthState::Finished;
            guard.touch();
        }
    }

    /// Generate the three-ping speed probe payloads; classification of
    /// measured RTTs against [`FAST_LINK_THRESHOLD`] happens at the call
    /// site once replies arrive, since that requires actual I/O.
    pub fn speed_probe_payloads() -> Vec<[u8; SPEED_PROBE_PAYLOAD_LEN]> {
        let mut rng = rand::thread_rng();
        (0..SPEED_PROBE_PINGS)
            .map(|_| {
                let mut buf = [0u8; SPEED_PROBE_PAYLOAD_LEN];
                rng.fill_bytes(&mut buf);
                buf
            })
            .collect()
    }

    pub fn classify_speed(rtts: &[Duration]) -> LinkSpeed {
        if rtts.is_empty() {
            return LinkSpeed::Slow;
        }
        let total: Duration = rtts.iter().sum();
        let any_single_slow = rtts.iter().any(|rtt| *rtt > SLOW_SINGLE_RTT_THRESHOLD);
        if total <= FAST_LINK_THRESHOLD && !any_single_slow {
            LinkSpeed::Fast
        } else {
            LinkSpeed::Slow
        }
    }

    pub async fn set_speed(&self, node_id: u32, speed: LinkSpeed) {
        if let Some(peer) = self.peers.get(&node_id) {
            peer.lock().await.speed = Some(speed);
        }
    }

    /// Close sockets that have been idle past `max_idle`, starting with
    /// the least-recently-used entries (spec §4.5 idle-socket reaping).
    pub async fn close_idle(&self, max_idle: Duration) {
        let mut to_close = Vec::new();
        for entry in self.peers.iter() {
            let guard = entry.value().lock().await;
            if guard.conn_state == ConnState::Established && guard.last_activity.elapsed() > max_idle {
                to_close.push(*entry.key());
            }
        }
        for node_id in to_close {
            if let Some(peer) = self.peers.get(&node_id) {
                let mut guard = peer.lock().await;
                guard.stream = None;
                guard.conn_state = ConnState::None;
                guard.auth_state = AuthState::None;
            }
            self.idle_lru.invalidate(&node_id);
        }
    }

    pub fn conn_state(&self, node_id: u32) -> ConnState {
        self.peers.get(&node_id).map(|p| p.blocking_lock().conn_state).unwrap_or(ConnState::None)
    }

    /// The last-classified speed for `node_id`'s link, defaulting to
    /// `Slow` for a peer that hasn't completed a speed probe yet (spec
    /// §4.5/§4.7 — treat an unknown link as saturated rather than fast).
    pub fn peer_speed(&self, node_id: u32) -> LinkSpeed {
        self.peers.get(&node_id).and_then(|p| p.blocking_lock().speed).unwrap_or(LinkSpeed::Slow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_break_favours_lower_id() {
        let mgr = ConnectionManager::new(5, 10);
        assert_eq!(mgr.tie_break(10), ConnState::Connecting);
        assert_eq!(mgr.tie_break(1), ConnState::Passive);
    }

    #[test]
    fn backoff_is_flat_fifteen_seconds() {
        let mgr = ConnectionManager::new(1, 10);
        for _ in 0..5 {
            assert_eq!(mgr.next_backoff(2), Duration::from_secs(15));
        }
    }

    #[test]
    fn speed_classification_thresholds() {
        let fast = vec![Duration::from_millis(5), Duration::from_millis(10)];
        let slow_total = vec![Duration::from_millis(20), Duration::from_millis(30)];
        let slow_single_spike = vec![Duration::from_millis(1), Duration::from_millis(1), Duration::from_millis(1100)];
        assert_eq!(ConnectionManager::classify_speed(&fast), LinkSpeed::Fast);
        assert_eq!(ConnectionManager::classify_speed(&slow_total), LinkSpeed::Slow);
        assert_eq!(ConnectionManager::classify_speed(&slow_single_spike), LinkSpeed::Slow);
    }
}

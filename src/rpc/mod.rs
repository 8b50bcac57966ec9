//! RPC dispatcher (C6 — spec §4.1/§4.6).
//!
//! Assigns request ids, tracks in-flight requests awaiting a reply, and
//! dispatches inbound packets by [`crate::codec::Direction`]. Generalises
//! the teacher's `ReadTask`/`VfsTask`/`StreamWriter` split (`src/lib.rs`):
//! one task reads frames off the socket, looks up (or creates) the
//! matching in-flight slot, and wakes the waiter via a oneshot channel
//! instead of blocking the read loop on the handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};

use crate::codec::{decode_header, Direction};
use crate::error::{ReconcileError, Result};

/// No reply within this long and the caller gives up (spec §4.6).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Plain count of slow-link requests currently in flight (spec §4.6/§4.7:
/// "more than zero pending ⇒ throttled"). Unlike a semaphore this never
/// refuses an `acquire` — it only reports how many requests a caller
/// like [`crate::reconcile::update::update_file`] should treat as reason
/// enough to back off and requeue rather than pile more work onto an
/// already-busy slow link.
#[derive(Default)]
pub struct SlowLinkCounter {
    pending: AtomicU32,
}

impl SlowLinkCounter {
    pub fn new() -> Self {
        SlowLinkCounter { pending: AtomicU32::new(0) }
    }

    pub fn acquire(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Requests currently in flight on this slow link.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

struct InFlight {
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

/// Per-connection RPC multiplexer: owns the request-id counter and the
/// in-flight table for one peer's socket.
pub struct RpcDispatcher {
    next_request_id: AtomicU32,
    in_flight: DashMap<u32, InFlight>,
    slow_link: Arc<SlowLinkCounter>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        RpcDispatcher {
            next_request_id: AtomicU32::new(1),
            in_flight: DashMap::new(),
            slow_link: Arc::new(SlowLinkCounter::new()),
        }
    }

    pub fn alloc_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending request, returning the receiver the caller
    /// awaits (with [`REQUEST_TIMEOUT`]) for the matching reply body.
    pub fn begin_request(&self, request_id: u32) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(request_id, InFlight { reply: Some(tx) });
        rx
    }

    /// Await a reply, failing with [`ReconcileError::RequestTimeout`] if
    /// none arrives within [`REQUEST_TIMEOUT`].
    pub async fn wait_reply(&self, request_id: u32, rx: oneshot::Receiver<Vec<u8>>) -> Result<Vec<u8>> {
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ReconcileError::ConnectionClosed),
            Err(_) => {
                self.in_flight.remove(&request_id);
                Err(ReconcileError::RequestTimeout)
            }
        }
    }

    /// Feed one fully-framed packet off the wire: for replies, wake the
    /// matching waiter; for requests/one-ways, hand the body back to the
    /// caller for dispatch to the reconciliation engine / VFS layer.
    pub fn on_frame<'a>(&self, buf: &'a [u8]) -> Result<Dispatch<'a>> {
        let (header, dec) = decode_header(buf)?;
        match header.direction {
            Direction::Reply => {
                if let Some((_, mut slot)) = self.in_flight.remove(&header.request_id) {
                    if let Some(tx) = slot.reply.take() {
                        let _ = tx.send(dec.rest().to_vec());
                    }
                }
                Ok(Dispatch::HandledReply)
            }
            Direction::Request => Ok(Dispatch::Request { request_id: header.request_id, rest: dec.rest() }),
            Direction::OneWay => Ok(Dispatch::OneWay { rest: dec.rest() }),
        }
    }

    pub fn slow_link(&self) -> Arc<SlowLinkCounter> {
        self.slow_link.clone()
    }

    /// Drop every pending request with [`ReconcileError::ConnectionClosed`],
    /// called when the owning socket is torn down (spec §4.6).
    pub fn abort_all(&self) {
        self.in_flight.clear();
    }
}

/// Result of classifying one inbound frame by direction.
pub enum Dispatch<'a> {
    HandledReply,
    Request { request_id: u32, rest: &'a [u8] },
    OneWay { rest: &'a [u8] },
}

/// The function-id registry (spec §6): `NULL = 0` through the highest
/// reconciliation op. Kept as a flat table rather than one enum variant
/// per RPC so new ops can be appended without renumbering.
pub mod function {
    pub const NULL: u32 = 0;
    pub const PING: u32 = 1;
    pub const ROOT: u32 = 2;
    pub const VOLUME_ROOT: u32 = 3;
    pub const GETATTR: u32 = 4;
    pub const SETATTR: u32 = 5;
    pub const LOOKUP: u32 = 6;
    pub const CREATE: u32 = 7;
    pub const OPEN: u32 = 8;
    pub const CLOSE: u32 = 9;
    pub const READDIR: u32 = 10;
    pub const MKDIR: u32 = 11;
    pub const RMDIR: u32 = 12;
    pub const RENAME: u32 = 13;
    pub const LINK: u32 = 14;
    pub const UNLINK: u32 = 15;
    pub const READ: u32 = 16;
    pub const WRITE: u32 = 17;
    pub const READLINK: u32 = 18;
    pub const SYMLINK: u32 = 19;
    pub const MKNOD: u32 = 20;
    pub const AUTH_STAGE1: u32 = 21;
    pub const AUTH_STAGE2: u32 = 22;
    pub const MD5SUM: u32 = 23;
    pub const FILE_INFO: u32 = 24;
    /// One-way (spec §6): triggers a config reload, no reply expected.
    pub const REREAD_CONFIG: u32 = 25;
    pub const REINTEGRATE: u32 = 26;
    pub const REINTEGRATE_ADD: u32 = 27;
    pub const REINTEGRATE_DEL: u32 = 28;
    pub const REINTEGRATE_SET: u32 = 29;
    pub const INVALIDATE: u32 = 30;
}

/// Reserved volume ids (spec §6).
pub const VOLUME_ID_VIRTUAL: u32 = 0;
pub const VOLUME_ID_CONFIG: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_reply, encode_request, finish};

    #[tokio::test]
    async fn reply_wakes_matching_waiter() {
        let dispatcher = RpcDispatcher::new();
        let id = dispatcher.alloc_request_id();
        let rx = dispatcher.begin_request(id);

        let mut enc = encode_reply(id, 0);
        enc.u32(42).unwrap();
        let buf = finish(enc).unwrap();
        dispatcher.on_frame(&buf).unwrap();

        let body = dispatcher.wait_reply(id, rx).await.unwrap();
        let mut dec = crate::codec::Decoder::new(&body);
        assert_eq!(dec.u32().unwrap(), 42);
    }

    #[test]
    fn request_frame_is_classified_for_dispatch() {
        let dispatcher = RpcDispatcher::new();
        let mut enc = encode_request(5, function::GETATTR);
        enc.u32(7).unwrap();
        let buf = finish(enc).unwrap();
        match dispatcher.on_frame(&buf).unwrap() {
            Dispatch::Request { request_id, .. } => assert_eq!(request_id, 5),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn slow_link_counter_tracks_pending_requests() {
        let counter = SlowLinkCounter::new();
        assert_eq!(counter.pending(), 0);
        counter.acquire();
        counter.acquire();
        assert_eq!(counter.pending(), 2);
        counter.release();
        assert_eq!(counter.pending(), 1);
    }
}

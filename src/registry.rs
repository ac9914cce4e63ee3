//! Future & channel registries, per §4.4.
//!
//! Instance-scoped (per Design Note 3, §9) rather than process-wide
//! globals, so multiple engines/tests never contaminate each other.
//! Backed by `dashmap` for per-key atomic insert/remove, satisfying the
//! "concurrent read-mostly access" requirement of §5 without a coarse
//! lock.

use std::sync::mpsc::{self, Receiver, SyncSender};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::protocol::QueryResult;

/// A backend-assigned connection identifier (§3 `ConnectionId`).
pub type ConnectionId = u32;

/// A local transport-channel identity — whatever the caller uses to name
/// one physical socket/stream (e.g. a pool slot index or a socket fd).
/// Generic so this crate doesn't dictate the transport.
pub trait ChannelIdentity: std::hash::Hash + Eq + Clone + Send + Sync + 'static {}
impl<T: std::hash::Hash + Eq + Clone + Send + Sync + 'static> ChannelIdentity for T {}

/// Single-producer/single-consumer slot carrying a completed
/// [`QueryResult`] (§3 `ResponseFuture`).
///
/// Created by the caller before sending the request, completed by the
/// response state machine, consumed exactly once.
pub struct ResponseFuture {
    rx: Receiver<Result<QueryResult>>,
}

/// The producer half, held by the registry until the response state
/// machine completes it.
pub struct ResponseFutureSender {
    tx: SyncSender<Result<QueryResult>>,
}

/// Create a fresh, empty response future pair.
pub fn response_future() -> (ResponseFutureSender, ResponseFuture) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ResponseFutureSender { tx }, ResponseFuture { rx })
}

impl ResponseFutureSender {
    /// Complete the future. A send failure means the caller gave up
    /// waiting (§4.3.2: "future with no waiter on completion: discard
    /// result; log" is the caller-side analogue of this).
    pub fn complete(self, result: Result<QueryResult>) {
        let _ = self.tx.send(result);
    }
}

impl ResponseFuture {
    /// Block the calling thread until the response state machine
    /// completes this future. Per §5, awaiting happens only on the
    /// caller's thread — never inside the state machine itself.
    pub fn get(self) -> Result<QueryResult> {
        self.rx
            .recv()
            .map_err(|_| Error::Execution("response future dropped without completion".into()))?
    }
}

/// Channel → ConnectionId mapping (§4.4), written once at handshake
/// completion, read on every inbound packet.
pub struct ChannelRegistry<C: ChannelIdentity> {
    map: DashMap<C, ConnectionId>,
}

impl<C: ChannelIdentity> ChannelRegistry<C> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn record(&self, channel: C, connection_id: ConnectionId) {
        self.map.insert(channel, connection_id);
    }

    pub fn lookup(&self, channel: &C) -> Option<ConnectionId> {
        self.map.get(channel).map(|entry| *entry.value())
    }

    pub fn remove(&self, channel: &C) {
        self.map.remove(channel);
    }
}

impl<C: ChannelIdentity> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// ConnectionId → pending-future mapping (§4.4), written by the request
/// path immediately before flushing the command packet, read+cleared by
/// the state machine at the response boundary.
///
/// Invariant: at most one in-flight `ResponseFuture` per `ConnectionId`;
/// a second registration before the first is cleared is a caller bug and
/// fails loudly rather than silently overwriting.
pub struct FutureRegistry {
    map: DashMap<ConnectionId, ResponseFutureSender>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Register a sender for an about-to-be-sent request. Returns an
    /// `ExecutionError` if one is already registered for this connection.
    pub fn register(&self, connection_id: ConnectionId, sender: ResponseFutureSender) -> Result<()> {
        match self.map.entry(connection_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Execution(format!(
                "connection {connection_id} already has an in-flight response future"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sender);
                Ok(())
            }
        }
    }

    /// Complete and clear the slot for `connection_id`, if one exists.
    /// Returns `false` (and logs) if there was no waiter — §4.3.2's
    /// "future with no waiter on completion: discard result; log".
    pub fn complete(&self, connection_id: ConnectionId, result: Result<QueryResult>) -> bool {
        match self.map.remove(&connection_id) {
            Some((_, sender)) => {
                sender.complete(result);
                true
            }
            None => {
                log::warn!("response for connection {connection_id} completed with no waiter; discarding");
                false
            }
        }
    }
}

impl Default for FutureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

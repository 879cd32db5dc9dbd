//! Live venue connections, keyed by the identity each one handshook with

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Error, Result, VenueGateway};
use crate::transport::message::VenueMessage;

pub type ConnId = u64;

/// Shared handle to one connection's outbound queue and close signal.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnId,
    peer: String,
    outbound: flume::Sender<String>,
    closed: watch::Sender<bool>,
    missed_pongs: AtomicU32,
    last_seen: Mutex<Instant>,
}

impl ConnectionHandle {
    /// Returns the handle and the receiving end of its outbound queue.
    pub fn new(id: ConnId, peer: impl Into<String>, buffer: usize) -> (Self, flume::Receiver<String>) {
        let (tx, rx) = flume::bounded(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer: peer.into(),
                outbound: tx,
                closed,
                missed_pongs: AtomicU32::new(0),
                last_seen: Mutex::new(Instant::now()),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Queue an encoded frame. Fails if the connection is closed or backed up.
    pub fn try_send(&self, frame: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::VenueUnreachable);
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            flume::TrySendError::Full(_) => {
                warn!(conn = self.id(), "outbound queue full");
                Error::VenueUnreachable
            }
            flume::TrySendError::Disconnected(_) => Error::VenueUnreachable,
        })
    }

    pub fn send_message(&self, message: &VenueMessage) -> Result<()> {
        self.try_send(message.encode()?)
    }

    /// Signal the reader, writer and keepalive tasks to stop.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Any inbound traffic proves liveness.
    pub fn touch(&self) {
        *self.inner.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.last_seen.lock().elapsed()
    }

    pub fn record_pong(&self) {
        self.inner.missed_pongs.store(0, Ordering::Relaxed);
        self.touch();
    }

    /// Count one more unanswered ping; returns the running total.
    pub fn record_ping(&self) -> u32 {
        self.inner.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_pongs(&self) -> u32 {
        self.inner.missed_pongs.load(Ordering::Relaxed)
    }
}

/// Connection label used to bind in-flight requests: `identity#conn`.
pub fn label(identity: &str, conn: ConnId) -> String {
    format!("{}#{}", identity, conn)
}

/// Identity table. At most one live connection per identity.
#[derive(Default)]
pub struct ConnectionRegistry {
    live: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `handle` under `identity`, evicting any previous connection.
    /// The evicted connection gets a best-effort disconnect notice and is closed.
    pub fn upsert(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.live.write().insert(identity.to_string(), handle.clone());

        match previous {
            Some(old) if old.id() != handle.id() => {
                info!(
                    identity,
                    old_conn = old.id(),
                    new_conn = handle.id(),
                    "🔁 Replacing stale venue connection"
                );
                if let Err(e) = old.send_message(&VenueMessage::disconnect("replaced by new connection")) {
                    debug!(identity, "disconnect notice not delivered: {}", e);
                }
                old.close();
                Some(old)
            }
            _ => None,
        }
    }

    /// Remove `identity` only while it still maps to connection `conn`.
    pub fn remove(&self, identity: &str, conn: ConnId) -> bool {
        let mut live = self.live.write();
        match live.get(identity) {
            Some(h) if h.id() == conn => {
                live.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<ConnectionHandle> {
        self.live.read().get(identity).cloned()
    }

    pub fn identities(&self) -> Vec<String> {
        self.live.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }

    /// Send a disconnect notice to every live connection and close them all.
    pub fn disconnect_all(&self, reason: &str) {
        let drained: Vec<(String, ConnectionHandle)> = self.live.write().drain().collect();
        for (identity, handle) in drained {
            if let Err(e) = handle.send_message(&VenueMessage::disconnect(reason)) {
                debug!(identity = %identity, "disconnect notice not delivered: {}", e);
            }
            handle.close();
        }
    }
}

impl VenueGateway for ConnectionRegistry {
    fn send(&self, message: &VenueMessage) -> Result<String> {
        let frame = message.encode()?;
        // snapshot so no lock is held while queueing
        let candidates: Vec<(String, ConnectionHandle)> = self
            .live
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (identity, handle) in candidates {
            match handle.try_send(frame.clone()) {
                Ok(()) => {
                    debug!(identity = %identity, kind = %message.kind(), "➡️ queued for venue");
                    return Ok(label(&identity, handle.id()));
                }
                Err(e) => warn!(identity = %identity, "send failed, trying next venue: {}", e),
            }
        }
        Err(Error::VenueUnreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::MessageKind;

    #[test]
    fn test_upsert_replaces_and_closes_old() {
        let registry = ConnectionRegistry::new();
        let (first, first_rx) = ConnectionHandle::new(1, "10.0.0.1:4000", 8);
        let (second, _second_rx) = ConnectionHandle::new(2, "10.0.0.1:4001", 8);

        assert!(registry.upsert("mt5-a", first.clone()).is_none());
        let evicted = registry.upsert("mt5-a", second.clone()).unwrap();

        assert_eq!(evicted.id(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mt5-a").unwrap().id(), 2);
        assert!(first.is_closed());
        assert!(!second.is_closed());

        let notice = first_rx.try_recv().unwrap();
        assert!(notice.contains(r#""type":"disconnect""#));
    }

    #[test]
    fn test_remove_requires_matching_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = ConnectionHandle::new(1, "a", 8);
        let (new, _rx2) = ConnectionHandle::new(2, "b", 8);
        registry.upsert("mt5-a", old);
        registry.upsert("mt5-a", new);

        // the evicted connection's teardown must not drop its successor
        assert!(!registry.remove("mt5-a", 1));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("mt5-a", 2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_skips_dead_connections() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.send(&VenueMessage::ping()),
            Err(Error::VenueUnreachable)
        ));

        let (dead, _dead_rx) = ConnectionHandle::new(1, "a", 8);
        dead.close();
        let (alive, alive_rx) = ConnectionHandle::new(2, "b", 8);
        registry.upsert("dead", dead);
        registry.upsert("alive", alive);

        let route = registry.send(&VenueMessage::ping()).unwrap();
        assert_eq!(route, "alive#2");
        let frame = alive_rx.try_recv().unwrap();
        assert!(frame.contains(MessageKind::Ping.tag()));
    }

    #[test]
    fn test_missed_pong_accounting() {
        let (handle, _rx) = ConnectionHandle::new(7, "a", 1);
        assert_eq!(handle.record_ping(), 1);
        assert_eq!(handle.record_ping(), 2);
        handle.record_pong();
        assert_eq!(handle.missed_pongs(), 0);
    }
}

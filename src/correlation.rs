//! Request/response correlation
//!
//! Turns fire-and-forget venue messaging into bounded request/response
//! calls. A caller registers a [`Waiter`] under a request id, sends its
//! request, then waits. The dispatch path resolves the waiter when the
//! tagged response arrives. Each id resolves at most once; the entry is
//! removed on every exit path (reply, timeout, disconnect or drop).

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{Error, Result};

enum Outcome<T> {
    Reply(T),
    Disconnected(String),
}

struct Slot<T> {
    seq: u64,
    tx: oneshot::Sender<Outcome<T>>,
    /// Connection the request went out on, once known
    route: Option<String>,
}

/// Routes already abandoned. Labels are never reused, so a bounded
/// history is enough to catch a bind that lost the race with a disconnect.
const CLOSED_ROUTE_HISTORY: usize = 1024;

struct Table<T> {
    next_seq: u64,
    slots: HashMap<String, Slot<T>>,
    closed: HashSet<String>,
    closed_order: VecDeque<String>,
}

impl<T> Table<T> {
    fn mark_closed(&mut self, route: &str) {
        if !self.closed.insert(route.to_string()) {
            return;
        }
        self.closed_order.push_back(route.to_string());
        if self.closed_order.len() > CLOSED_ROUTE_HISTORY {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

/// Waiter table shared by every in-flight call.
pub struct Correlator<T> {
    table: Mutex<Table<T>>,
}

impl<T: Send> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Correlator<T> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_seq: 0,
                slots: HashMap::new(),
                closed: HashSet::new(),
                closed_order: VecDeque::new(),
            }),
        }
    }

    /// Register a waiter for `id`. Only one request per id may be in flight.
    pub fn register(&self, id: impl Into<String>) -> Result<Waiter<'_, T>> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        let mut table = self.table.lock();
        if table.slots.contains_key(&id) {
            return Err(Error::DuplicateRequest(id));
        }
        table.next_seq += 1;
        let seq = table.next_seq;
        table.slots.insert(id.clone(), Slot { seq, tx, route: None });
        drop(table);

        Ok(Waiter {
            correlator: self,
            id,
            seq,
            rx: Some(rx),
        })
    }

    /// Record which connection carried request `id`. If that connection is
    /// already gone the waiter fails with `VenueDisconnected` right away.
    pub fn bind(&self, id: &str, route: impl Into<String>) {
        let route = route.into();
        let mut table = self.table.lock();
        if table.closed.contains(&route) {
            let Some(slot) = table.slots.remove(id) else {
                return;
            };
            drop(table);
            debug!(request_id = id, route = %route, "bound to a closed connection");
            let _ = slot.tx.send(Outcome::Disconnected(route));
            return;
        }
        if let Some(slot) = table.slots.get_mut(id) {
            slot.route = Some(route);
        }
    }

    /// Hand `reply` to the waiter for `id`. Late and duplicate replies are
    /// dropped; returns whether a waiter took it.
    pub fn resolve(&self, id: &str, reply: T) -> bool {
        let Some(slot) = self.table.lock().slots.remove(id) else {
            debug!(request_id = id, "no waiter (late or duplicate response), dropping");
            return false;
        };
        if slot.tx.send(Outcome::Reply(reply)).is_err() {
            warn!(request_id = id, "waiter gone before delivery, dropping response");
            return false;
        }
        true
    }

    /// Fail every waiter bound to `route` with `VenueDisconnected`.
    pub fn abandon_route(&self, route: &str) -> usize {
        let abandoned: Vec<(String, Slot<T>)> = {
            let mut table = self.table.lock();
            table.mark_closed(route);
            let ids: Vec<String> = table
                .slots
                .iter()
                .filter(|(_, s)| s.route.as_deref() == Some(route))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.slots.remove(&id).map(|s| (id, s)))
                .collect()
        };

        let count = abandoned.len();
        for (id, slot) in abandoned {
            debug!(request_id = %id, route, "abandoning waiter");
            let _ = slot.tx.send(Outcome::Disconnected(route.to_string()));
        }
        if count > 0 {
            warn!(route, count, "⚠️ connection lost with requests in flight");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.table.lock().slots.len()
    }

    fn unregister(&self, id: &str, seq: u64) {
        let mut table = self.table.lock();
        if table.slots.get(id).is_some_and(|s| s.seq == seq) {
            table.slots.remove(id);
        }
    }
}

/// One registered request. Dropping it unregisters the id.
pub struct Waiter<'a, T: Send> {
    correlator: &'a Correlator<T>,
    id: String,
    seq: u64,
    rx: Option<oneshot::Receiver<Outcome<T>>>,
}

impl<T: Send> Waiter<'_, T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::InvalidState(format!("waiter {} already consumed", self.id)));
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Outcome::Reply(reply))) => Ok(reply),
            Ok(Ok(Outcome::Disconnected(route))) => Err(Error::VenueDisconnected(route)),
            Ok(Err(_)) => Err(Error::InvalidState(format!("waiter {} dropped", self.id))),
            Err(_) => Err(Error::Timeout(self.id.clone())),
        }
    }
}

impl<T: Send> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.correlator.unregister(&self.id, self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_delivers_exactly_once() {
        let correlator = Correlator::<u32>::new();
        let waiter = correlator.register("t-1").unwrap();

        assert!(correlator.resolve("t-1", 7));
        assert!(!correlator.resolve("t-1", 8));

        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), 7);
        assert!(!correlator.resolve("t-1", 9));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_unregisters() {
        let correlator = Correlator::<u32>::new();
        let waiter = correlator.register("t-2").unwrap();

        let err = waiter.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(id) if id == "t-2"));
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.resolve("t-2", 1));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let correlator = Correlator::<u32>::new();
        let first = correlator.register("t-3").unwrap();
        assert!(matches!(
            correlator.register("t-3"),
            Err(Error::DuplicateRequest(_))
        ));
        drop(first);
        assert!(correlator.register("t-3").is_ok());
    }

    #[tokio::test]
    async fn test_abandon_route_fails_fast() {
        let correlator = Correlator::<u32>::new();
        let bound = correlator.register("t-4").unwrap();
        let other = correlator.register("t-5").unwrap();
        correlator.bind("t-4", "mt5-a#1");
        correlator.bind("t-5", "mt5-b#2");

        assert_eq!(correlator.abandon_route("mt5-a#1"), 1);
        let err = bound.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::VenueDisconnected(r) if r == "mt5-a#1"));
        assert_eq!(correlator.pending(), 1);
        drop(other);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_bind_to_closed_route_fails_fast() {
        let correlator = Correlator::<u32>::new();
        assert_eq!(correlator.abandon_route("mt5-a#1"), 0);

        let waiter = correlator.register("t-6").unwrap();
        correlator.bind("t-6", "mt5-a#1");
        let err = waiter.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::VenueDisconnected(r) if r == "mt5-a#1"));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ids_do_not_cross() {
        let correlator = Arc::new(Correlator::<usize>::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let c = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let waiter = c.register(format!("req-{}", i)).unwrap();
                waiter.wait(Duration::from_secs(2)).await.unwrap()
            }));
        }
        // let every task register before resolving
        while correlator.pending() < 16 {
            tokio::task::yield_now().await;
        }
        for i in 0..16 {
            assert!(correlator.resolve(&format!("req-{}", i), i));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), i);
        }
    }
}

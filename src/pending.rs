//! Packet-identifier keyed state shared between the pipelines.
//!
//! Two instantiations are used: the in-flight outbound table
//! (`PacketMap<Packet>`) and the pending-result table
//! (`PacketMap<AckSender>`).

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::v4::SubscribeReasonCode;

/// Result of a request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Acknowledgement carrying no payload (PUBACK, PUBCOMP, UNSUBACK).
    Empty,
    /// SUBACK: granted QoS (or failure) per requested filter.
    Granted(Vec<SubscribeReasonCode>),
    /// The session was torn down before the broker answered.
    Cancelled,
}

/// One-shot completion slot for a suspended [`send_receive`] caller.
///
/// [`send_receive`]: crate::Session::send_receive
pub type AckSender = oneshot::Sender<Ack>;

/// Concurrency-safe map keyed by packet identifier.
///
/// Every operation is atomic on its key; in particular [`remove`] is an
/// atomic take, so a value can be claimed by exactly one caller.
///
/// [`remove`]: PacketMap::remove
#[derive(Debug, Default)]
pub struct PacketMap<V> {
    inner: Mutex<HashMap<u16, V>>,
}

impl<V> PacketMap<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a value, returning the value previously registered under
    /// `pkid` if any.
    pub fn insert(&self, pkid: u16, value: V) -> Option<V> {
        self.inner.lock().insert(pkid, value)
    }

    /// Insert or replace the value under `pkid`.
    pub fn update(&self, pkid: u16, value: V) {
        self.inner.lock().insert(pkid, value);
    }

    /// Atomically take the value under `pkid`.
    pub fn remove(&self, pkid: u16) -> Option<V> {
        self.inner.lock().remove(&pkid)
    }

    /// Drain every entry.
    pub fn take_all(&self) -> Vec<(u16, V)> {
        self.inner.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<V: Clone> PacketMap<V> {
    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<(u16, V)> {
        self.inner.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_takes_once() {
        let map = PacketMap::new();
        map.update(7, "a");
        assert_eq!(map.remove(7), Some("a"));
        assert_eq!(map.remove(7), None);
    }

    #[test]
    fn test_insert_returns_prior() {
        let map = PacketMap::new();
        assert_eq!(map.insert(1, "a"), None);
        assert_eq!(map.insert(1, "b"), Some("a"));
        assert_eq!(map.remove(1), Some("b"));
    }

    #[test]
    fn test_take_all_drains() {
        let map = PacketMap::new();
        map.update(1, "a");
        map.update(2, "b");
        let mut drained = map.take_all();
        drained.sort_by_key(|(k, _)| *k);
        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshot_leaves_entries() {
        let map = PacketMap::new();
        map.update(1, "a");
        assert_eq!(map.snapshot(), vec![(1, "a")]);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_slot_fires_once() {
        let map: PacketMap<AckSender> = PacketMap::new();
        let (tx, rx) = oneshot::channel();
        map.update(3, tx);

        if let Some(slot) = map.remove(3) {
            slot.send(Ack::Empty).unwrap();
        }
        // A second completion finds the slot already claimed.
        assert!(map.remove(3).is_none());
        assert_eq!(rx.await.unwrap(), Ack::Empty);
    }
}

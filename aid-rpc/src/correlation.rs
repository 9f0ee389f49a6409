//! Client-side correlation table.
//!
//! Maps correlation ids of in-flight calls to the slot their reply is
//! delivered into. Inserts and removals are sharded, so callers and the
//! reply consumer never contend on one lock.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<String, oneshot::Sender<Vec<u8>>>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a call. The returned guard deregisters it when dropped.
    pub fn register(self: &Arc<Self>, correlation_id: &str) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        match self.calls.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(RpcError::CorrelationCollision(correlation_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingCall {
                    correlation_id: correlation_id.to_string(),
                    reply: rx,
                    table: Arc::clone(self),
                })
            }
        }
    }

    /// Hand a reply body to its waiting call. False when nobody waits for it.
    pub fn complete(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        match self.calls.remove(correlation_id) {
            Some((_, slot)) => slot.send(body).is_ok(),
            None => false,
        }
    }

    /// Deregister a call; safe to repeat and to race with [`complete`](Self::complete)
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Drop every registration; their waiters observe a closed slot
    pub fn drain(&self) -> usize {
        let count = self.calls.len();
        self.calls.clear();
        count
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// One registered call, waiting for its reply
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: String,
    reply: oneshot::Receiver<Vec<u8>>,
    table: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply body. `None` when the registration was dropped
    /// without a reply (the table was drained).
    pub async fn reply(&mut self) -> Option<Vec<u8>> {
        (&mut self.reply).await.ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.cancel(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_reaches_its_call() {
        let table = PendingCalls::new();
        let mut call = table.register("a").unwrap();
        assert!(table.contains("a"));

        assert!(table.complete("a", b"50".to_vec()));
        assert_eq!(call.reply().await, Some(b"50".to_vec()));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_id_is_a_collision() {
        let table = PendingCalls::new();
        let _call = table.register("a").unwrap();
        let err = table.register("a").unwrap_err();
        assert!(matches!(err, RpcError::CorrelationCollision(id) if id == "a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_and_late_replies_are_ignored() {
        let table = PendingCalls::new();
        assert!(!table.complete("ghost", Vec::new()));

        let call = table.register("late").unwrap();
        drop(call);
        assert!(table.is_empty());
        assert!(!table.complete("late", Vec::new()));
        assert!(!table.cancel("late"));
    }

    #[tokio::test]
    async fn drain_wakes_waiters_empty_handed() {
        let table = PendingCalls::new();
        let mut first = table.register("1").unwrap();
        let mut second = table.register("2").unwrap();

        assert_eq!(table.drain(), 2);
        assert_eq!(first.reply().await, None);
        assert_eq!(second.reply().await, None);
    }

    #[tokio::test]
    async fn concurrent_registrations() {
        let table = PendingCalls::new();
        let mut handles = Vec::new();
        for i in 0..200 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let id = format!("call-{i}");
                let mut call = table.register(&id).unwrap();
                let completer = Arc::clone(&table);
                let reply_id = id.clone();
                tokio::spawn(async move {
                    completer.complete(&reply_id, reply_id.clone().into_bytes());
                });
                call.reply().await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(format!("call-{i}").into_bytes()));
        }
        assert!(table.is_empty());
    }
}

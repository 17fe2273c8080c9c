//! Request correlation table
//!
//! Maps a request id to the waiting caller. Entries leave the table when the
//! reply arrives, when the caller times out or goes away, and when the
//! connection drops.

use std::collections::HashMap;

use pulsechat_core::PulseResult;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type ReplySender = oneshot::Sender<PulseResult<Value>>;

#[derive(Default)]
pub struct PendingRequests {
    waiting: HashMap<String, ReplySender>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn contains(&self, req_id: &str) -> bool {
        self.waiting.contains_key(req_id)
    }

    /// Register a waiter, dropping entries whose caller has already gone
    pub fn insert(&mut self, req_id: String, reply: ReplySender) {
        self.prune();
        trace!(req_id = %req_id, "pending request registered");
        self.waiting.insert(req_id, reply);
    }

    /// Deliver a reply; returns false for ids that are not pending
    pub fn complete(&mut self, req_id: &str, result: PulseResult<Value>) -> bool {
        match self.waiting.remove(req_id) {
            Some(reply) => {
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, req_id: &str) -> bool {
        self.waiting.remove(req_id).is_some()
    }

    /// Fail every waiter with errors built by `error`
    pub fn fail_all<F>(&mut self, mut error: F)
    where
        F: FnMut() -> pulsechat_core::PulseError,
    {
        if !self.waiting.is_empty() {
            debug!(count = self.waiting.len(), "failing pending requests");
        }
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(error()));
        }
    }

    fn prune(&mut self) {
        self.waiting.retain(|_, reply| !reply.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsechat_core::PulseError;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("r1".into(), tx);

        assert!(pending.complete("r1", Ok(json!({"ok": true}))));
        assert!(!pending.complete("r1", Ok(json!({}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_id_is_stale() {
        let mut pending = PendingRequests::new();
        assert!(!pending.complete("nope", Ok(Value::Null)));
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("r1".into(), tx);
        drop(rx);

        let (tx2, _rx2) = oneshot::channel();
        pending.insert("r2".into(), tx2);
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("r2"));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("r1".into(), tx);
        pending.fail_all(|| PulseError::closed("connection"));
        assert!(rx.await.unwrap().is_err());
        assert!(pending.is_empty());
    }
}

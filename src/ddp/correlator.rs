use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, RemoteError, Result};

/// Ids up to this value are reserved for the handshake.
const RESERVED_IDS: u64 = 1;

/// Why the correlator stopped accepting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shutdown {
    ConnectionLost,
    Closed,
}

impl Shutdown {
    fn error(self) -> Error {
        match self {
            Shutdown::ConnectionLost => Error::ConnectionLost,
            Shutdown::Closed => Error::Closed,
        }
    }
}

#[derive(Debug)]
struct State {
    next_id: u64,
    shutdown: Option<Shutdown>,
    calls: HashMap<String, oneshot::Sender<Result<Value>>>,
}

/// Tracks outstanding method calls by id.
#[derive(Debug)]
pub(crate) struct Correlator {
    state: Mutex<State>,
}

/// A registered call waiting for its `result` frame.
///
/// Dropping it unregisters the call.
#[derive(Debug)]
pub(crate) struct PendingCall<'a> {
    pub id: String,
    rx: oneshot::Receiver<Result<Value>>,
    correlator: &'a Correlator,
}

impl PendingCall<'_> {
    pub async fn wait(mut self) -> Result<Value> {
        (&mut self.rx).await.unwrap_or(Err(Error::ConnectionLost))
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.correlator.forget(&self.id);
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: RESERVED_IDS + 1,
                shutdown: None,
                calls: HashMap::new(),
            }),
        }
    }

    /// Allocate the next call id and register a waiter for it.
    pub fn register(&self) -> Result<PendingCall<'_>> {
        let mut state = self.lock();
        if let Some(shutdown) = state.shutdown {
            return Err(shutdown.error());
        }

        let id = state.next_id.to_string();
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();
        state.calls.insert(id.clone(), tx);
        Ok(PendingCall {
            id,
            rx,
            correlator: self,
        })
    }

    /// Resolve a pending call from a `result` frame.
    ///
    /// Returns `false` when no call with this id is outstanding.
    pub fn resolve(&self, id: &str, result: Option<Value>, error: Option<Value>) -> bool {
        let Some(tx) = self.lock().calls.remove(id) else {
            return false;
        };

        let outcome = match error {
            Some(error) => Err(Error::Rpc(RemoteError::from_value(error))),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
        true
    }

    /// Stop tracking a call nobody waits for any more.
    pub fn forget(&self, id: &str) {
        self.lock().calls.remove(id);
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn shutdown(&self, reason: Shutdown) {
        let calls = {
            let mut state = self.lock();
            state.shutdown.get_or_insert(reason);
            std::mem::take(&mut state.calls)
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(reason.error()));
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_start_above_reserved_and_increase() {
        let correlator = Correlator::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| correlator.register().unwrap().id.parse().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn ids_are_not_reused_after_resolution() {
        let correlator = Correlator::new();
        let first = correlator.register().unwrap();
        assert!(correlator.resolve(&first.id, Some(json!("ok")), None));
        let second = correlator.register().unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn resolve_delivers_result() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        assert!(correlator.resolve(&call.id, Some(json!("ok")), None));
        assert_eq!(call.wait().await.unwrap(), json!("ok"));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn missing_result_resolves_to_null() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        correlator.resolve(&call.id, None, None);
        assert_eq!(call.wait().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn error_payload_fails_the_call() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        correlator.resolve(&call.id, None, Some(json!({"error": 404, "reason": "nope"})));
        match call.wait().await {
            Err(Error::Rpc(err)) => assert_eq!(err.reason.as_deref(), Some("nope")),
            other => panic!("Expected Rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_dropped_without_side_effects() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();

        assert!(!correlator.resolve("999", Some(json!(1)), None));
        assert_eq!(correlator.pending(), 1);

        correlator.resolve(&call.id, Some(json!(2)), None);
        assert_eq!(call.wait().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_future_calls() {
        let correlator = Correlator::new();
        let a = correlator.register().unwrap();
        let b = correlator.register().unwrap();

        correlator.shutdown(Shutdown::ConnectionLost);

        assert!(matches!(a.wait().await, Err(Error::ConnectionLost)));
        assert!(matches!(b.wait().await, Err(Error::ConnectionLost)));
        assert!(matches!(correlator.register(), Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn abandoned_calls_are_forgotten() {
        let correlator = Correlator::new();
        for _ in 0..5 {
            let call = correlator.register().unwrap();
            let waited =
                tokio::time::timeout(std::time::Duration::from_millis(10), call.wait()).await;
            assert!(waited.is_err());
        }
        assert_eq!(correlator.pending(), 0);

        let kept = correlator.register().unwrap();
        assert_eq!(correlator.pending(), 1);
        drop(kept);
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn first_shutdown_reason_wins() {
        let correlator = Correlator::new();
        correlator.shutdown(Shutdown::Closed);
        correlator.shutdown(Shutdown::ConnectionLost);
        assert!(matches!(correlator.register(), Err(Error::Closed)));
    }
}

//! Request/response correlation for bidirectional transports.
//!
//! A transport that multiplexes responses over one connection (child-process
//! stdio, WebSocket) registers every outbound request id here, then resolves
//! the matching waiter when the response frame arrives. Every wait carries a
//! deadline: on expiry the pending record is released and a late response is
//! silently discarded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;

/// Pending outcome: the response, or a transport-level failure reason.
type PendingResult = Result<JsonRpcMessage, String>;

/// Table of in-flight requests keyed by the stable id form.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<PendingResult>>>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<PendingResult>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pending request and get the receiver to wait on.
    pub fn register(&self, id_key: String) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        self.table().insert(id_key, tx);
        rx
    }

    /// Resolve a pending request with an inbound response.
    ///
    /// Returns false when no record exists (late or unsolicited response);
    /// the caller discards the message.
    pub fn resolve(&self, response: JsonRpcMessage) -> bool {
        let Some(key) = response.id_key() else {
            return false;
        };
        let Some(waiter) = self.table().remove(&key) else {
            return false;
        };
        waiter.send(Ok(response)).is_ok()
    }

    /// Drop one pending record (deadline expiry).
    pub fn forget(&self, id_key: &str) {
        self.table().remove(id_key);
    }

    /// Reject every pending request with the given reason.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.table().drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// True when no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Await a registered receiver under a mandatory deadline.
    ///
    /// Expiry releases the pending record and rejects with
    /// "Request timeout"; a dropped or failed channel rejects with the
    /// transport's reason.
    pub async fn wait(
        &self,
        id_key: &str,
        rx: oneshot::Receiver<PendingResult>,
        deadline: Duration,
    ) -> Result<JsonRpcMessage, GateError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(GateError::Transport(reason)),
            Ok(Err(_)) => Err(GateError::Transport("Transport stopped".to_string())),
            Err(_) => {
                self.forget(id_key);
                Err(GateError::Timeout("Request timeout".to_string()))
            }
        }
    }
}

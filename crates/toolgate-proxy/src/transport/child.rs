//! Child-process backend transport.
//!
//! Spawns a backend MCP server as a child process and speaks
//! newline-delimited JSON over its stdin/stdout. Stderr is drained into the
//! log. Unlike the bare stdio surface, this transport layers the
//! [`Correlator`] over the framing so `send_request` works: every outbound
//! request id maps to a waiter, responses resolve it, deadlines reject it.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::tool::BackendConfig;
use toolgate_types::traits::{NotificationHandler, RequestHandler, Transport, TransportHealth};

use crate::correlate::Correlator;

use super::{Handlers, DEFAULT_REQUEST_TIMEOUT_MS};

struct ChildState {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    read_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

/// Transport to a spawned backend process.
pub struct ChildProcessTransport {
    config: BackendConfig,
    state: Mutex<Option<ChildState>>,
    correlator: Arc<Correlator>,
    handlers: Handlers,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl ChildProcessTransport {
    /// Transport for the given backend config; call `start` to spawn.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            correlator: Arc::new(Correlator::new()),
            handlers: Handlers::default(),
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(0),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Override the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allocate the next outbound request id.
    fn next_request_id(&self) -> serde_json::Value {
        json!(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn write_line(
        stdin: &Arc<Mutex<ChildStdin>>,
        message: &JsonRpcMessage,
    ) -> Result<(), GateError> {
        let mut encoded = serde_json::to_string(message)?;
        encoded.push('\n');
        let mut stdin = stdin.lock().await;
        stdin
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| GateError::Transport(format!("backend stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| GateError::Transport(format!("backend stdin flush failed: {e}")))
    }

    async fn stdin_handle(&self) -> Result<Arc<Mutex<ChildStdin>>, GateError> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|s| s.stdin.clone())
            .ok_or_else(|| GateError::Transport("transport not started".to_string()))
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn start(&self) -> Result<(), GateError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(GateError::Transport("transport already started".to_string()));
        }
        if self.config.command.is_empty() {
            return Err(GateError::InvalidInput(format!(
                "backend '{}' has no command",
                self.config.name
            )));
        }

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GateError::Transport(format!(
                    "failed to spawn backend '{}': {e}",
                    self.config.name
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            GateError::Transport("backend child has no stdout pipe".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            GateError::Transport("backend child has no stdin pipe".to_string())
        })?;
        let stderr = child.stderr.take();

        self.connected.store(true, Ordering::SeqCst);
        let stdin = Arc::new(Mutex::new(stdin));

        // Read loop: correlate responses, hand the rest to handlers.
        let correlator = self.correlator.clone();
        let handlers = self.handlers.clone();
        let connected = self.connected.clone();
        let backend = self.config.name.clone();
        let read_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message = match JsonRpcMessage::parse_line(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(backend = %backend, error = %e, "malformed frame from backend");
                        continue;
                    }
                };
                if message.is_response() {
                    if !correlator.resolve(message) {
                        debug!(backend = %backend, "discarding late response from backend");
                    }
                } else if message.is_notification() {
                    if let Some(handler) = handlers.notification() {
                        handler.handle_notification(message, &backend).await;
                    }
                } else {
                    debug!(
                        backend = %backend,
                        method = ?message.method,
                        "ignoring backend-initiated request"
                    );
                }
            }
            connected.store(false, Ordering::SeqCst);
            correlator.fail_all("Transport stopped");
            info!(backend = %backend, "backend stdout closed");
        });

        // Stderr drain: one log line per backend line.
        let stderr_task = stderr.map(|stderr| {
            let backend = self.config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %backend, "stderr: {line}");
                }
            })
        });

        *state = Some(ChildState {
            child,
            stdin,
            read_task,
            stderr_task,
        });
        info!(backend = %self.config.name, command = %self.config.command, "backend spawned");
        Ok(())
    }

    async fn stop(&self) -> Result<(), GateError> {
        let taken = self.state.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        self.correlator.fail_all("Transport stopped");
        if let Some(mut state) = taken {
            state.read_task.abort();
            if let Some(task) = state.stderr_task.take() {
                task.abort();
            }
            if let Err(e) = state.child.kill().await {
                debug!(backend = %self.config.name, error = %e, "backend kill failed");
            }
            info!(backend = %self.config.name, "backend stopped");
        }
        Ok(())
    }

    fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.set_request(handler);
    }

    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.set_notification(handler);
    }

    async fn send_request(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GateError::Transport("transport not started".to_string()));
        }
        let mut request = request;
        if request.id.is_none() {
            request.id = Some(self.next_request_id());
        }
        let id_key = request
            .id_key()
            .ok_or_else(|| GateError::InvalidInput("request requires an id".to_string()))?;

        let rx = self.correlator.register(id_key.clone());
        let stdin = self.stdin_handle().await?;
        if let Err(e) = Self::write_line(&stdin, &request).await {
            self.correlator.forget(&id_key);
            return Err(e);
        }
        self.correlator.wait(&id_key, rx, self.request_timeout).await
    }

    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError> {
        let stdin = self.stdin_handle().await?;
        Self::write_line(&stdin, &notification).await
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.connected.load(Ordering::SeqCst),
            pending_requests: self.correlator.len(),
            supports_push: true,
        }
    }
}

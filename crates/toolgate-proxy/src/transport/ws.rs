//! WebSocket client transport.
//!
//! One persistent connection keyed by URL. Outgoing requests register a
//! pending record and resolve on the matching inbound response; only
//! correlated ids matter, response order is not guaranteed. Disconnects
//! reject every inflight request with "Transport stopped" and trigger
//! reconnection with exponential backoff bounded by `reconnect_attempts`
//! and `reconnect_delay`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::traits::{NotificationHandler, RequestHandler, Transport, TransportHealth};

use crate::correlate::Correlator;

use super::{Handlers, DEFAULT_REQUEST_TIMEOUT_MS};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default number of reconnect attempts after a disconnect.
pub const DEFAULT_RECONNECT_ATTEMPTS: usize = 5;
/// Default base delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 250;

fn lock<T>(cell: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// WebSocket transport to a remote MCP endpoint.
pub struct WsTransport {
    url: String,
    correlator: Arc<Correlator>,
    handlers: Handlers,
    connected: Arc<AtomicBool>,
    out_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reconnect_attempts: usize,
    reconnect_delay: Duration,
}

impl WsTransport {
    /// Transport for the given URL; call `start` to connect.
    pub fn new(url: String) -> Self {
        Self {
            url,
            correlator: Arc::new(Correlator::new()),
            handlers: Handlers::default(),
            connected: Arc::new(AtomicBool::new(false)),
            out_tx: std::sync::Mutex::new(None),
            shutdown: std::sync::Mutex::new(None),
            supervisor: std::sync::Mutex::new(None),
            next_id: AtomicU64::new(0),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }

    /// Override the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the reconnect policy.
    pub fn with_reconnect(mut self, attempts: usize, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    fn next_request_id(&self) -> serde_json::Value {
        json!(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Message>, GateError> {
        lock(&self.out_tx)
            .clone()
            .ok_or_else(|| GateError::Transport("transport not started".to_string()))
    }
}

struct SupervisorParams {
    url: String,
    correlator: Arc<Correlator>,
    handlers: Handlers,
    connected: Arc<AtomicBool>,
    reconnect_attempts: usize,
    reconnect_delay: Duration,
}

/// Handle one inbound text frame.
async fn handle_frame(
    text: &str,
    params: &SupervisorParams,
    out_tx: &mpsc::UnboundedSender<Message>,
) {
    let message = match JsonRpcMessage::parse_line(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(url = %params.url, error = %e, "malformed WebSocket frame");
            return;
        }
    };
    if message.is_response() {
        if !params.correlator.resolve(message) {
            debug!(url = %params.url, "discarding late WebSocket response");
        }
    } else if message.is_notification() {
        if let Some(handler) = params.handlers.notification() {
            handler.handle_notification(message, &params.url).await;
        }
    } else if let Some(handler) = params.handlers.request() {
        // Server-initiated request: answer out of band so the read loop
        // keeps draining frames.
        let out_tx = out_tx.clone();
        let url = params.url.clone();
        tokio::spawn(async move {
            let response = handler.handle_request(message, &url).await;
            if let Ok(encoded) = serde_json::to_string(&response) {
                let _ = out_tx.send(Message::Text(encoded));
            }
        });
    }
}

/// Owns the socket: writes queued frames, reads inbound frames, reconnects.
async fn run_supervisor(
    mut socket: WsSocket,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    out_tx: mpsc::UnboundedSender<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
    params: SupervisorParams,
) {
    'outer: loop {
        // Connected phase.
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = socket.close(None).await;
                    break 'outer;
                }
                queued = out_rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if let Err(e) = socket.send(frame).await {
                                warn!(url = %params.url, error = %e, "WebSocket write failed");
                                break;
                            }
                        }
                        None => break 'outer,
                    }
                }
                frame = socket.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame(&text, &params, &out_tx).await;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            warn!(url = %params.url, "WebSocket disconnected");
                            break;
                        }
                    }
                }
            }
        }

        // Disconnected: inflight requests reject, then try to reconnect.
        params.connected.store(false, Ordering::SeqCst);
        params.correlator.fail_all("Transport stopped");

        let mut delay = params.reconnect_delay;
        let mut reconnected = None;
        for attempt in 1..=params.reconnect_attempts {
            tokio::select! {
                _ = shutdown_rx.changed() => break 'outer,
                _ = tokio::time::sleep(delay) => {}
            }
            match connect_async(&params.url).await {
                Ok((socket, _)) => {
                    info!(url = %params.url, attempt = attempt, "WebSocket reconnected");
                    reconnected = Some(socket);
                    break;
                }
                Err(e) => {
                    warn!(
                        url = %params.url,
                        attempt = attempt,
                        error = %e,
                        "WebSocket reconnect attempt failed"
                    );
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
        match reconnected {
            Some(next) => {
                socket = next;
                params.connected.store(true, Ordering::SeqCst);
            }
            None => break 'outer,
        }
    }

    params.connected.store(false, Ordering::SeqCst);
    params.correlator.fail_all("Transport stopped");
    debug!(url = %params.url, "WebSocket supervisor finished");
}

#[async_trait]
impl Transport for WsTransport {
    async fn start(&self) -> Result<(), GateError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(GateError::Transport("transport already started".to_string()));
        }
        let (socket, _) = connect_async(&self.url)
            .await
            .map_err(|e| GateError::Transport(format!("failed to connect {}: {e}", self.url)))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.connected.store(true, Ordering::SeqCst);

        let params = SupervisorParams {
            url: self.url.clone(),
            correlator: self.correlator.clone(),
            handlers: self.handlers.clone(),
            connected: self.connected.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
        };
        let task = tokio::spawn(run_supervisor(
            socket,
            out_rx,
            out_tx.clone(),
            shutdown_rx,
            params,
        ));

        *lock(&self.out_tx) = Some(out_tx);
        *lock(&self.shutdown) = Some(shutdown_tx);
        *lock(&self.supervisor) = Some(task);
        info!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    async fn stop(&self) -> Result<(), GateError> {
        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(true);
        }
        self.connected.store(false, Ordering::SeqCst);
        self.correlator.fail_all("Transport stopped");
        let task = lock(&self.supervisor).take();
        if let Some(task) = task {
            // Give the supervisor a moment to close the socket cleanly; it
            // always exits on the shutdown signal, so detaching is safe.
            if tokio::time::timeout(Duration::from_millis(250), task)
                .await
                .is_err()
            {
                debug!(url = %self.url, "WebSocket supervisor still draining after stop");
            }
        }
        *lock(&self.out_tx) = None;
        Ok(())
    }

    fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.set_request(handler);
    }

    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.set_notification(handler);
    }

    async fn send_request(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError> {
        let mut request = request;
        if request.id.is_none() {
            request.id = Some(self.next_request_id());
        }
        let id_key = request
            .id_key()
            .ok_or_else(|| GateError::InvalidInput("request requires an id".to_string()))?;

        let sender = self.sender()?;
        let encoded = serde_json::to_string(&request)?;
        let rx = self.correlator.register(id_key.clone());
        if sender.send(Message::Text(encoded)).is_err() {
            self.correlator.forget(&id_key);
            return Err(GateError::Transport("Transport stopped".to_string()));
        }
        self.correlator.wait(&id_key, rx, self.request_timeout).await
    }

    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError> {
        let sender = self.sender()?;
        let encoded = serde_json::to_string(&notification)?;
        sender
            .send(Message::Text(encoded))
            .map_err(|_| GateError::Transport("Transport stopped".to_string()))
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.connected.load(Ordering::SeqCst),
            pending_requests: self.correlator.len(),
            supports_push: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct WsTestState {
        /// Number of sockets accepted so far.
        accepted: Arc<AtomicUsize>,
        /// Close the first `close_first_n` sockets immediately after accept.
        close_first_n: usize,
        /// Reply to requests at all.
        reply: bool,
    }

    async fn ws_echo(socket: WebSocket, state: WsTestState) {
        let nth = state.accepted.fetch_add(1, Ordering::SeqCst);
        let mut socket = socket;
        if nth < state.close_first_n {
            let _ = socket.close().await;
            return;
        }
        while let Some(Ok(frame)) = socket.recv().await {
            if let AxumMessage::Text(text) = frame {
                if !state.reply {
                    continue;
                }
                let request: JsonRpcMessage = serde_json::from_str(&text).unwrap();
                let response = JsonRpcMessage::response(
                    request.id.clone(),
                    serde_json::json!({"method": request.method}),
                );
                let encoded = serde_json::to_string(&response).unwrap();
                if socket.send(AxumMessage::Text(encoded)).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn start_ws_server(state: WsTestState) -> String {
        let app = Router::new()
            .route(
                "/ws",
                get(|upgrade: WebSocketUpgrade, State(state): State<WsTestState>| async move {
                    upgrade.on_upgrade(move |socket| ws_echo(socket, state))
                }),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/ws")
    }

    fn replying_state() -> WsTestState {
        WsTestState {
            accepted: Arc::new(AtomicUsize::new(0)),
            close_first_n: 0,
            reply: true,
        }
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let url = start_ws_server(replying_state()).await;
        let transport = WsTransport::new(url).with_request_timeout(Duration::from_secs(2));
        transport.start().await.unwrap();

        let response = transport
            .send_request(JsonRpcMessage::request(json!(1), "tools/list", json!({})))
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.result.unwrap()["method"], "tools/list");
        assert_eq!(transport.health().pending_requests, 0);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_drops_pending() {
        let url = start_ws_server(WsTestState {
            accepted: Arc::new(AtomicUsize::new(0)),
            close_first_n: 0,
            reply: false,
        })
        .await;
        let transport = WsTransport::new(url).with_request_timeout(Duration::from_millis(80));
        transport.start().await.unwrap();

        let err = transport
            .send_request(JsonRpcMessage::request(json!(1), "tools/list", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Request timeout"));
        assert_eq!(transport.health().pending_requests, 0);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejects_inflight() {
        let url = start_ws_server(WsTestState {
            accepted: Arc::new(AtomicUsize::new(0)),
            close_first_n: 0,
            reply: false,
        })
        .await;
        let transport = Arc::new(
            WsTransport::new(url).with_request_timeout(Duration::from_secs(5)),
        );
        transport.start().await.unwrap();

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send_request(JsonRpcMessage::request(json!(1), "x", json!({})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.stop().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Transport stopped"), "got: {err}");
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        // The server closes the first socket immediately; the transport
        // reconnects and the next request succeeds.
        let url = start_ws_server(WsTestState {
            accepted: Arc::new(AtomicUsize::new(0)),
            close_first_n: 1,
            reply: true,
        })
        .await;
        let transport = WsTransport::new(url)
            .with_request_timeout(Duration::from_secs(2))
            .with_reconnect(5, Duration::from_millis(20));
        transport.start().await.unwrap();

        // Wait for the disconnect + reconnect cycle.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.health().connected);

        let response = transport
            .send_request(JsonRpcMessage::request(json!(2), "system/info", json!({})))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["method"], "system/info");

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_bounded_attempts() {
        let url = start_ws_server(replying_state()).await;
        let transport = WsTransport::new(url.clone()).with_reconnect(2, Duration::from_millis(10));
        transport.start().await.unwrap();
        transport.stop().await.unwrap();

        // After stop, requests fail immediately.
        let err = transport
            .send_request(JsonRpcMessage::request(json!(1), "x", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not started") || err.to_string().contains("stopped"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_error() {
        let transport = WsTransport::new("ws://127.0.0.1:1/ws".to_string());
        assert!(transport.start().await.is_err());
        assert!(!transport.health().connected);
    }
}

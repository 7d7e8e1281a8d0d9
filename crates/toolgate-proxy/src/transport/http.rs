//! HTTP transport: one POST per JSON-RPC message.
//!
//! The client side posts each message as a JSON body and parses a 2xx body
//! as the response; 204/empty bodies acknowledge notifications. The server
//! side hosts a local listener on a configurable port routing `POST /` to
//! the registered request handler and `GET /ws` to a WebSocket upgrade for
//! clients that need server push. Plain HTTP cannot receive notifications;
//! pushed notifications reach WebSocket connections only.
//!
//! When an auth token is configured, every surface requires
//! `Authorization: Bearer <token>`, compared in constant time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::traits::{NotificationHandler, RequestHandler, Transport, TransportHealth};

use super::{Handlers, DEFAULT_REQUEST_TIMEOUT_MS};

// ============================================================
// Client
// ============================================================

/// HTTP client transport to a remote MCP endpoint.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpTransport {
    /// Transport posting to the given URL with the default deadline.
    pub fn new(url: String) -> Result<Self, GateError> {
        Self::with_timeout(url, Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    /// Transport posting to the given URL with an explicit deadline.
    pub fn with_timeout(url: String, timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url,
            client,
            connected: AtomicBool::new(false),
        })
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<reqwest::Response, GateError> {
        self.client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GateError::Timeout("Request timeout".to_string())
                } else if e.is_connect() {
                    GateError::Transport(format!("failed to connect to {}: {e}", self.url))
                } else {
                    GateError::Transport(format!("HTTP request failed: {e}"))
                }
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<(), GateError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), GateError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_request_handler(&self, _handler: Arc<dyn RequestHandler>) {
        // The client side never receives requests; each POST has one reply.
    }

    fn set_notification_handler(&self, _handler: Arc<dyn NotificationHandler>) {}

    async fn send_request(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GateError::Transport("transport not started".to_string()));
        }
        let response = self.post(&request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::Transport(format!(
                "HTTP {status} from {}",
                self.url
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| GateError::Transport(format!("failed to read response body: {e}")))?;
        let message: JsonRpcMessage =
            serde_json::from_str(&body).map_err(|e| GateError::Parse(e.to_string()))?;
        Ok(message)
    }

    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GateError::Transport("transport not started".to_string()));
        }
        let response = self.post(&notification).await?;
        let status = response.status();
        // 204 or any empty 2xx acknowledges a notification.
        if status.is_success() {
            Ok(())
        } else {
            Err(GateError::Transport(format!(
                "HTTP {status} from {}",
                self.url
            )))
        }
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.connected.load(Ordering::SeqCst),
            pending_requests: 0,
            supports_push: false,
        }
    }
}

// ============================================================
// Server
// ============================================================

/// Header carrying the client's session key.
pub const SESSION_HEADER: &str = "mcp-session-id";
/// Fallback session key for POST clients that send no session header.
pub const DEFAULT_HTTP_SESSION: &str = "http:default";

#[derive(Clone)]
struct ServerState {
    handlers: Handlers,
    auth_token: Option<String>,
    notify_tx: broadcast::Sender<String>,
    ws_connections: Arc<AtomicUsize>,
}

impl ServerState {
    /// Constant-time bearer check. No configured token means open access.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.auth_token else {
            return true;
        };
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        provided.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

/// HTTP/WebSocket server transport.
///
/// Hosts `POST /` for request/response framing and `GET /ws` for clients
/// that need bidirectional framing and server push. Notifications sent
/// through this transport fan out to every live WebSocket connection.
pub struct HttpServerTransport {
    addr: SocketAddr,
    auth_token: Option<String>,
    handlers: Handlers,
    running: Arc<AtomicBool>,
    notify_tx: broadcast::Sender<String>,
    ws_connections: Arc<AtomicUsize>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServerTransport {
    /// Server listening on the given address once started.
    pub fn new(addr: SocketAddr) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            addr,
            auth_token: None,
            handlers: Handlers::default(),
            running: Arc::new(AtomicBool::new(false)),
            notify_tx,
            ws_connections: Arc::new(AtomicUsize::new(0)),
            serve_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Require `Authorization: Bearer <token>` on every surface.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// The bound address after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Number of live WebSocket connections.
    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    /// The axum router for this transport's endpoints.
    fn router(&self) -> Router {
        Router::new()
            .route("/", post(handle_post))
            .route("/ws", get(handle_ws_upgrade))
            .with_state(ServerState {
                handlers: self.handlers.clone(),
                auth_token: self.auth_token.clone(),
                notify_tx: self.notify_tx.clone(),
                ws_connections: self.ws_connections.clone(),
            })
    }
}

fn lock<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn handle_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !state.authorized(&headers) {
        let err = GateError::Unauthorized("bad or missing bearer token".to_string());
        let reply = JsonRpcMessage::from_gate_error(None, &err);
        return json_response(StatusCode::OK, &reply);
    }

    let session_key = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_HTTP_SESSION)
        .to_string();

    let message = match JsonRpcMessage::parse_line(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "rejecting malformed HTTP frame");
            let reply = JsonRpcMessage::from_gate_error(None, &e);
            return json_response(StatusCode::OK, &reply);
        }
    };

    if message.is_notification() {
        if let Some(handler) = state.handlers.notification() {
            handler.handle_notification(message, &session_key).await;
        }
        return StatusCode::NO_CONTENT.into_response();
    }

    let Some(handler) = state.handlers.request() else {
        let err = GateError::Internal("no request handler registered".to_string());
        let reply = JsonRpcMessage::from_gate_error(message.id.clone(), &err);
        return json_response(StatusCode::OK, &reply);
    };
    let response = handler.handle_request(message, &session_key).await;
    json_response(StatusCode::OK, &response)
}

async fn handle_ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    upgrade.on_upgrade(move |socket| ws_connection(socket, state))
}

/// Drive one WebSocket connection: dispatch inbound frames, forward pushed
/// notifications, answer parse failures in-band.
async fn ws_connection(mut socket: WebSocket, state: ServerState) {
    let session_key = format!("ws:{}", Uuid::new_v4());
    let mut notify_rx = state.notify_tx.subscribe();
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    debug!(session = %session_key, "WebSocket session opened");

    loop {
        tokio::select! {
            pushed = notify_rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if socket.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %session_key, skipped, "WebSocket notification lag");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(frame)) = inbound else {
                    break;
                };
                let WsMessage::Text(text) = frame else {
                    continue;
                };
                let message = match JsonRpcMessage::parse_line(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        let reply = JsonRpcMessage::from_gate_error(None, &e);
                        if let Ok(encoded) = serde_json::to_string(&reply) {
                            if socket.send(WsMessage::Text(encoded)).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                };
                if message.is_notification() {
                    if let Some(handler) = state.handlers.notification() {
                        handler.handle_notification(message, &session_key).await;
                    }
                    continue;
                }
                let Some(handler) = state.handlers.request() else {
                    continue;
                };
                let response = handler.handle_request(message, &session_key).await;
                if let Ok(encoded) = serde_json::to_string(&response) {
                    if socket.send(WsMessage::Text(encoded)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.ws_connections.fetch_sub(1, Ordering::SeqCst);
    debug!(session = %session_key, "WebSocket session closed");
}

fn json_response(status: StatusCode, message: &JsonRpcMessage) -> Response {
    let body = serde_json::to_string(message).unwrap_or_else(|_| {
        "{\"jsonrpc\":\"2.0\",\"error\":{\"code\":-32603,\"message\":\"encoding failed\"}}"
            .to_string()
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn start(&self) -> Result<(), GateError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GateError::Transport("transport already started".to_string()));
        }
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| GateError::Transport(format!("failed to bind {}: {e}", self.addr)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| GateError::Transport(format!("failed to read local addr: {e}")))?;
        *lock(&self.local_addr) = Some(bound);

        let app = self.router();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "HTTP listener exited");
            }
            running.store(false, Ordering::SeqCst);
        });
        *lock(&self.serve_task) = Some(task);
        info!(addr = %bound, "HTTP transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<(), GateError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.serve_task).take() {
            task.abort();
        }
        debug!("HTTP transport stopped");
        Ok(())
    }

    fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.set_request(handler);
    }

    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.set_notification(handler);
    }

    async fn send_request(&self, _request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError> {
        Err(GateError::Transport(
            "HTTP server cannot initiate requests".to_string(),
        ))
    }

    /// Push a notification to every live WebSocket connection. Plain HTTP
    /// clients cannot receive it.
    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError> {
        let encoded = serde_json::to_string(&notification)?;
        // No receivers is fine: nobody is listening over WebSocket.
        let _ = self.notify_tx.send(encoded);
        Ok(())
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.running.load(Ordering::SeqCst),
            pending_requests: 0,
            supports_push: true,
        }
    }
}

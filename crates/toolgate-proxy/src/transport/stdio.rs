//! Stdio transport: newline-delimited JSON, one message per line.
//!
//! This is the proxy's own serving surface — inbound requests are dispatched
//! to the registered handler and the handler's response is written back.
//! The bare transport has no correlation layer, so `send_request` rejects
//! with "correlation required"; only notifications can be pushed out.
//!
//! Parse failures answer with a `-32700` error response and the read loop
//! keeps going; a failure never drops the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::traits::{NotificationHandler, RequestHandler, Transport, TransportHealth};

use super::Handlers;

/// Session key under which every stdio request is handled.
pub const STDIO_SESSION_KEY: &str = "stdio";

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Newline-delimited JSON transport over an arbitrary reader/writer pair.
pub struct StdioTransport {
    reader: std::sync::Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    writer: SharedWriter,
    handlers: Handlers,
    running: Arc<AtomicBool>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Transport over the given reader/writer pair.
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: std::sync::Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            handlers: Handlers::default(),
            running: Arc::new(AtomicBool::new(false)),
            read_task: std::sync::Mutex::new(None),
        }
    }

    /// Transport over the process's real stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    }

    fn take_reader(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn store_task(&self, task: JoinHandle<()>) {
        let mut slot = match self.read_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(task);
    }
}

/// Serialize a message and write it as one line.
async fn write_line(writer: &SharedWriter, message: &JsonRpcMessage) -> Result<(), GateError> {
    let mut encoded = serde_json::to_string(message)?;
    encoded.push('\n');
    let mut writer = writer.lock().await;
    writer
        .write_all(encoded.as_bytes())
        .await
        .map_err(|e| GateError::Transport(format!("stdio write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| GateError::Transport(format!("stdio flush failed: {e}")))
}

/// Handle one inbound line: dispatch and write any response.
pub(crate) async fn dispatch_line(
    line: &str,
    writer: &SharedWriter,
    handlers: &Handlers,
    session_key: &str,
) {
    if line.trim().is_empty() {
        return;
    }
    let message = match JsonRpcMessage::parse_line(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping malformed stdio frame");
            let reply = JsonRpcMessage::from_gate_error(None, &e);
            let _ = write_line(writer, &reply).await;
            return;
        }
    };

    if message.is_request() {
        let Some(handler) = handlers.request() else {
            let err = GateError::Internal("no request handler registered".to_string());
            let reply = JsonRpcMessage::from_gate_error(message.id.clone(), &err);
            let _ = write_line(writer, &reply).await;
            return;
        };
        let response = handler.handle_request(message, session_key).await;
        let _ = write_line(writer, &response).await;
    } else if message.is_notification() {
        if let Some(handler) = handlers.notification() {
            handler.handle_notification(message, session_key).await;
        } else {
            debug!(method = ?message.method, "dropping notification with no handler");
        }
    } else {
        // A response with no outbound correlation layer: nothing waits on it.
        debug!(id = ?message.id, "discarding unsolicited response frame");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), GateError> {
        let Some(reader) = self.take_reader() else {
            return Err(GateError::Transport("stdio transport already started".to_string()));
        };
        self.running.store(true, Ordering::SeqCst);

        let writer = self.writer.clone();
        let handlers = self.handlers.clone();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                dispatch_line(&line, &writer, &handlers, STDIO_SESSION_KEY).await;
            }
            running.store(false, Ordering::SeqCst);
            debug!("stdio read loop finished");
        });
        self.store_task(task);
        Ok(())
    }

    async fn stop(&self) -> Result<(), GateError> {
        self.running.store(false, Ordering::SeqCst);
        let task = {
            let mut slot = match self.read_task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.set_request(handler);
    }

    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.set_notification(handler);
    }

    async fn send_request(&self, _request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError> {
        Err(GateError::Transport("correlation required".to_string()))
    }

    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError> {
        write_line(&self.writer, &notification).await
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.running.load(Ordering::SeqCst),
            pending_requests: 0,
            supports_push: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle_request(
            &self,
            message: JsonRpcMessage,
            session_key: &str,
        ) -> JsonRpcMessage {
            JsonRpcMessage::response(
                message.id.clone(),
                json!({"method": message.method, "session": session_key}),
            )
        }
    }

    struct CountingNotificationHandler {
        count: Arc<std::sync::Mutex<usize>>,
    }

    #[async_trait]
    impl NotificationHandler for CountingNotificationHandler {
        async fn handle_notification(&self, _message: JsonRpcMessage, _session_key: &str) {
            *self.count.lock().unwrap() += 1;
        }
    }

    /// Read one response line from the far end of the duplex pipe.
    async fn read_response(out: &mut (impl AsyncRead + Unpin)) -> JsonRpcMessage {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            out.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
        }
        serde_json::from_slice(&buffer).unwrap()
    }

    #[tokio::test]
    async fn test_request_dispatch_and_response() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));
        transport.set_request_handler(Arc::new(EchoHandler));
        transport.start().await.unwrap();

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();

        let response = read_response(&mut client_read).await;
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.result.as_ref().unwrap()["method"], "tools/list");
        assert_eq!(response.result.as_ref().unwrap()["session"], "stdio");

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_error_answers_32700_and_loop_survives() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));
        transport.set_request_handler(Arc::new(EchoHandler));
        transport.start().await.unwrap();

        client_write.write_all(b"{garbage\n").await.unwrap();
        let error_reply = read_response(&mut client_read).await;
        assert_eq!(error_reply.error.as_ref().unwrap().code, -32700);

        // The loop is still alive and serves the next request.
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let response = read_response(&mut client_read).await;
        assert_eq!(response.id, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_notifications_reach_handler_without_reply() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (_client_read, mut client_write) = tokio::io::split(client_side);

        let count = Arc::new(std::sync::Mutex::new(0));
        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));
        transport.set_notification_handler(Arc::new(CountingNotificationHandler {
            count: count.clone(),
        }));
        transport.start().await.unwrap();

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_request_rejects_without_correlation() {
        let (_client_side, server_side) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server_side);
        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));

        let err = transport
            .send_request(JsonRpcMessage::request(json!(1), "x", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("correlation required"));
    }

    #[tokio::test]
    async fn test_send_notification_writes_line() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (mut client_read, _client_write) = tokio::io::split(client_side);

        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));
        transport
            .send_notification(JsonRpcMessage::notification(
                "notifications/tools.listChanged",
                json!({}),
            ))
            .await
            .unwrap();

        let pushed = read_response(&mut client_read).await;
        assert_eq!(
            pushed.method.as_deref(),
            Some("notifications/tools.listChanged")
        );
        assert!(pushed.id.is_none());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_client_side, server_side) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server_side);
        let transport = StdioTransport::new(Box::new(server_read), Box::new(server_write));

        transport.start().await.unwrap();
        assert!(transport.start().await.is_err());
        transport.stop().await.unwrap();
        assert!(!transport.health().connected);
    }
}

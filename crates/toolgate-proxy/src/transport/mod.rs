/// Transport implementations for JSON-RPC 2.0 framing.
///
/// Transports are values behind `Box<dyn Transport>`, selected by
/// [`toolgate_types::tool::TransportKind`] at construction — dispatch by
/// tagged variant, not by subclassing.
pub mod child;
pub mod http;
pub mod stdio;
pub mod ws;

use std::sync::{Arc, Mutex};

use toolgate_types::errors::GateError;
use toolgate_types::tool::{BackendConfig, TransportKind};
use toolgate_types::traits::{NotificationHandler, RequestHandler, Transport};

pub use child::ChildProcessTransport;
pub use http::{HttpServerTransport, HttpTransport};
pub use stdio::StdioTransport;
pub use ws::WsTransport;

/// Default deadline for one outbound request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Build the client transport for a backend from its tagged config.
pub fn build_backend_transport(config: &BackendConfig) -> Result<Box<dyn Transport>, GateError> {
    Ok(match &config.transport {
        TransportKind::Stdio => Box::new(ChildProcessTransport::new(config.clone())),
        TransportKind::Http { url } => Box::new(HttpTransport::new(url.clone())?),
        TransportKind::WebSocket { url } => Box::new(WsTransport::new(url.clone())),
    })
}

/// Shared handler registration cell used by every transport.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    request: Arc<Mutex<Option<Arc<dyn RequestHandler>>>>,
    notification: Arc<Mutex<Option<Arc<dyn NotificationHandler>>>>,
}

impl Handlers {
    pub(crate) fn set_request(&self, handler: Arc<dyn RequestHandler>) {
        *lock(&self.request) = Some(handler);
    }

    pub(crate) fn set_notification(&self, handler: Arc<dyn NotificationHandler>) {
        *lock(&self.notification) = Some(handler);
    }

    pub(crate) fn request(&self) -> Option<Arc<dyn RequestHandler>> {
        lock(&self.request).clone()
    }

    pub(crate) fn notification(&self) -> Option<Arc<dyn NotificationHandler>> {
        lock(&self.notification).clone()
    }
}

fn lock<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

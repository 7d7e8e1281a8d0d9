/// Typed event bus shared by the gate, proxy, and server.
///
/// Event kinds are a closed sum type; components publish through an injected
/// `Arc<dyn EventBus>` and never through globals.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::traits::{EventBus, EventHandler};

/// Metrics record emitted after a provisioning run.
#[derive(Debug, Clone, Serialize)]
pub struct GatingMetrics {
    /// Tools matched by the discovery query.
    pub tools_discovered: usize,
    /// Tools that fit the token budget.
    pub tools_provisioned: usize,
    /// The requested budget.
    pub tokens_budgeted: f64,
    /// Estimated tokens actually used.
    pub tokens_used: u64,
}

/// Every event the proxy emits.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// A tool call completed successfully.
    ToolExecuteOk {
        /// Backend that served the call.
        backend: String,
        /// Tool name.
        tool: String,
        /// Wall time of the call in milliseconds.
        duration_ms: u64,
    },
    /// A tool call failed.
    ToolExecuteErr {
        /// Backend that served the call.
        backend: String,
        /// Tool name.
        tool: String,
        /// Error description.
        error: String,
    },
    /// A toolset was enabled automatically on first call to an owned tool.
    AutoEnable {
        /// Toolset id.
        toolset: String,
        /// Tool that triggered the enablement.
        tool: String,
    },
    /// A toolset was disabled by the TTL sweep.
    AutoDisableTtl {
        /// Toolset id.
        toolset: String,
    },
    /// A toolset was disabled by LRU cap enforcement.
    AutoDisableLru {
        /// Toolset id.
        toolset: String,
    },
    /// A backend connection was established.
    BackendConnected {
        /// Backend name.
        backend: String,
    },
    /// A backend connection was torn down.
    BackendDisconnected {
        /// Backend name.
        backend: String,
    },
    /// Discovery/provisioning metrics.
    GatingMetrics(GatingMetrics),
}

/// Discriminant for [`GateEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateEventKind {
    /// `tool.execute.ok`
    ToolExecuteOk,
    /// `tool.execute.err`
    ToolExecuteErr,
    /// `gate.auto_enable`
    AutoEnable,
    /// `gate.auto_disable.ttl`
    AutoDisableTtl,
    /// `gate.auto_disable.lru`
    AutoDisableLru,
    /// `backend.connected`
    BackendConnected,
    /// `backend.disconnected`
    BackendDisconnected,
    /// `gating.metrics`
    GatingMetrics,
}

impl GateEvent {
    /// The kind of this event.
    pub fn kind(&self) -> GateEventKind {
        match self {
            GateEvent::ToolExecuteOk { .. } => GateEventKind::ToolExecuteOk,
            GateEvent::ToolExecuteErr { .. } => GateEventKind::ToolExecuteErr,
            GateEvent::AutoEnable { .. } => GateEventKind::AutoEnable,
            GateEvent::AutoDisableTtl { .. } => GateEventKind::AutoDisableTtl,
            GateEvent::AutoDisableLru { .. } => GateEventKind::AutoDisableLru,
            GateEvent::BackendConnected { .. } => GateEventKind::BackendConnected,
            GateEvent::BackendDisconnected { .. } => GateEventKind::BackendDisconnected,
            GateEvent::GatingMetrics(_) => GateEventKind::GatingMetrics,
        }
    }
}

impl std::fmt::Display for GateEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GateEventKind::ToolExecuteOk => "tool.execute.ok",
            GateEventKind::ToolExecuteErr => "tool.execute.err",
            GateEventKind::AutoEnable => "gate.auto_enable",
            GateEventKind::AutoDisableTtl => "gate.auto_disable.ttl",
            GateEventKind::AutoDisableLru => "gate.auto_disable.lru",
            GateEventKind::BackendConnected => "backend.connected",
            GateEventKind::BackendDisconnected => "backend.disconnected",
            GateEventKind::GatingMetrics => "gating.metrics",
        };
        write!(f, "{name}")
    }
}

/// In-process event bus backed by a handler registry.
///
/// `publish` clones the handler list out of the lock and invokes handlers
/// outside it, so a handler may publish further events without deadlocking.
#[derive(Default)]
pub struct InMemoryEventBus {
    handlers: Mutex<HashMap<GateEventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: GateEvent) {
        let subscribers = {
            let handlers = match self.handlers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };
        for handler in subscribers {
            handler.on_event(&event);
        }
    }

    fn subscribe(&self, kind: GateEventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.entry(kind).or_default().push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the events it sees.
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl EventHandler for RecordingHandler {
        fn on_event(&self, event: &GateEvent) {
            self.seen.lock().unwrap().push(event.kind().to_string());
        }
    }

    #[test]
    fn test_publish_reaches_subscribed_kind_only() {
        let bus = InMemoryEventBus::new();
        let handler = RecordingHandler::new();
        bus.subscribe(GateEventKind::BackendConnected, handler.clone());

        bus.publish(GateEvent::BackendConnected {
            backend: "fs".into(),
        });
        bus.publish(GateEvent::BackendDisconnected {
            backend: "fs".into(),
        });

        assert_eq!(handler.count(), 1);
        assert_eq!(handler.seen.lock().unwrap()[0], "backend.connected");
    }

    #[test]
    fn test_multiple_handlers_per_kind() {
        let bus = InMemoryEventBus::new();
        let a = RecordingHandler::new();
        let b = RecordingHandler::new();
        bus.subscribe(GateEventKind::AutoEnable, a.clone());
        bus.subscribe(GateEventKind::AutoEnable, b.clone());

        bus.publish(GateEvent::AutoEnable {
            toolset: "fs".into(),
            tool: "fs/read".into(),
        });

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = InMemoryEventBus::new();
        bus.publish(GateEvent::GatingMetrics(GatingMetrics {
            tools_discovered: 3,
            tools_provisioned: 2,
            tokens_budgeted: 700.0,
            tokens_used: 700,
        }));
    }

    #[test]
    fn test_event_kind_names() {
        let event = GateEvent::AutoDisableTtl {
            toolset: "fs".into(),
        };
        assert_eq!(event.kind().to_string(), "gate.auto_disable.ttl");
    }
}

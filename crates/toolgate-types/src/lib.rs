/// Shared types, traits, and errors for the toolgate proxy.
///
/// This crate is the foundation that all other toolgate crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) that define module interfaces for parallel development
/// - **Wire types** (`rpc`) for JSON-RPC 2.0 framing
/// - **Tool model** (`tool`) shared across the gate, proxy, and server
/// - **Event bus** (`events`) injected into every component
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`, `config_loader`) for the filter configuration
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod events;
pub mod rpc;
pub mod tool;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use errors::GateError;
pub use events::{GateEvent, GateEventKind, InMemoryEventBus};
pub use rpc::{JsonRpcError, JsonRpcMessage};
pub use tool::{BackendConfig, ToolDescriptor, ToolsetManifest, ToolsetState, TransportKind};
pub use traits::*;

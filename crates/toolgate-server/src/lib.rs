/// MCP server subsystem for the toolgate proxy.
///
/// Hosts the client-facing surface:
/// - **Session manager**: per-connection state, activity tracking, expiry
/// - **Load balancer**: rate limiting, circuit breaking, bounded queueing
/// - **Router**: JSON-RPC method dispatch plus the built-in gate tools
/// - **Server**: wiring, serving loops, and the periodic sweeper
pub mod builtin;
pub mod load_balancer;
pub mod router;
pub mod server;
pub mod session;

pub use load_balancer::{CircuitState, LoadBalancer};
pub use router::McpRouter;
pub use server::{BackendToolsetLoader, McpServer};
pub use session::SessionManager;

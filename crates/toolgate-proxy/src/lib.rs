/// Proxy subsystem for the toolgate gateway.
///
/// Manages every backend MCP server connection and the path a tool call
/// takes to reach one:
/// - **Transports**: JSON-RPC 2.0 framing over stdio, HTTP, and WebSocket
/// - **Client manager**: backend lifecycle and tool-call routing
/// - **Proxy service**: input validation against tool schemas and dispatch
pub mod correlate;
pub mod manager;
pub mod service;
pub mod transport;

pub use manager::ClientManager;
pub use service::ProxyService;

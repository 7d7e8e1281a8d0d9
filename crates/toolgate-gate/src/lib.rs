/// Tool gating subsystem for the toolgate proxy.
///
/// Keeps the client-visible tool surface small:
/// - **Schema optimizer**: strips schema fat before descriptors reach a client
/// - **Repository**: indexed store of every known tool descriptor
/// - **Filter chain**: ordered, side-effect-free view filters
/// - **Controller**: toolset lifecycle with TTL/LRU eviction, pinning, and
///   auto-enable on call
/// - **Discovery**: keyword-scored lookup plus token-budgeted provisioning
pub mod controller;
pub mod discovery;
pub mod filters;
pub mod repository;
pub mod schema;

pub use controller::{GateController, GateControllerConfig, UsageStat};
pub use discovery::{discover, discover_scored, estimate_tokens, provision, GatingService};
pub use filters::{FilterChain, FilterContext};
pub use repository::{SearchOptions, ToolRepository};
pub use schema::{optimize_descriptor, optimize_schema};

/// Configuration types for the toolgate proxy.
///
/// The filter configuration mirrors the exact JSON shape read from the file
/// named by the `TOOL_FILTER_CONFIG` environment variable; everything else
/// is assembled programmatically by the embedder.
use serde::{Deserialize, Serialize};

/// Default TTL for unpinned idle toolsets, in milliseconds.
pub const DEFAULT_AUTO_DISABLE_TTL_MS: u64 = 300_000;
/// Default interval between TTL/LRU sweeps, in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
/// Default bound on a toolset loader await, in milliseconds.
pub const DEFAULT_LOADER_TIMEOUT_MS: u64 = 30_000;

/// Task-type filter section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTypeFilterConfig {
    /// Whether the filter participates in the chain.
    #[serde(default)]
    pub enabled: bool,
    /// task type → allowed tool names.
    #[serde(default)]
    pub map: std::collections::HashMap<String, Vec<String>>,
}

/// Resource filter section.
///
/// `max_tools` present and ≤ 0 drops everything; absent means no limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceFilterConfig {
    /// Whether the filter participates in the chain.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of tools surfaced to the client.
    #[serde(default, rename = "maxTools", skip_serializing_if = "Option::is_none")]
    pub max_tools: Option<i64>,
}

/// Security filter section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityFilterConfig {
    /// Whether the filter participates in the chain.
    #[serde(default)]
    pub enabled: bool,
    /// Tool names removed from every view.
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Conflict-resolution policy when several toolsets own the same tool name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Pick an owner that is already active, else the first listed.
    #[default]
    #[serde(rename = "prefer-enabled")]
    PreferEnabled,
    /// Always the first listed owner.
    #[serde(rename = "first-match")]
    FirstMatch,
    /// Fail with `Ambiguous` when more than one owner exists.
    #[serde(rename = "error")]
    Error,
}

/// The filter configuration file shape (`TOOL_FILTER_CONFIG`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// Task-type filter.
    #[serde(default)]
    pub task_type: TaskTypeFilterConfig,
    /// Resource filter.
    #[serde(default)]
    pub resource: ResourceFilterConfig,
    /// Security filter.
    #[serde(default)]
    pub security: SecurityFilterConfig,
    /// TTL for unpinned idle toolsets, milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub auto_disable_ttl_ms: u64,
    /// Cap on concurrently active toolsets; 0 = unlimited.
    #[serde(default)]
    pub max_active_toolsets: usize,
    /// Whether a call to an inactive tool may enable its owning toolset.
    #[serde(default)]
    pub auto_enable_on_call: bool,
    /// Lowercase tool names when indexing/looking up owners.
    #[serde(default)]
    pub auto_enable_case_insensitive: bool,
    /// Owner selection when several toolsets claim a name.
    #[serde(default)]
    pub auto_enable_conflict_resolution: ConflictResolution,
    /// When non-empty, only matching names may auto-enable.
    /// Patterns support a "p/*" prefix form.
    #[serde(default)]
    pub auto_enable_allowlist: Vec<String>,
    /// Matching names never auto-enable.
    #[serde(default)]
    pub auto_enable_blocklist: Vec<String>,
}

fn default_ttl_ms() -> u64 {
    DEFAULT_AUTO_DISABLE_TTL_MS
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            task_type: TaskTypeFilterConfig::default(),
            resource: ResourceFilterConfig::default(),
            security: SecurityFilterConfig::default(),
            auto_disable_ttl_ms: DEFAULT_AUTO_DISABLE_TTL_MS,
            max_active_toolsets: 0,
            auto_enable_on_call: false,
            auto_enable_case_insensitive: false,
            auto_enable_conflict_resolution: ConflictResolution::default(),
            auto_enable_allowlist: Vec::new(),
            auto_enable_blocklist: Vec::new(),
        }
    }
}

/// Match a tool name against an allow/block pattern.
///
/// `"p/*"` matches every name under the `p/` prefix; anything else matches
/// exactly. Case folding is the caller's concern (apply normalization to
/// both sides first).
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// What to do when the request queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOverflow {
    /// Reject the incoming request with `-32000`.
    #[default]
    Reject,
    /// Drop the oldest queued record to make room.
    DropOldest,
}

/// Load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Fixed-window admission limit, global per proxy process.
    pub max_requests_per_second: u32,
    /// Consecutive failures that trip a breaker open.
    pub circuit_breaker_threshold: u32,
    /// How long a breaker stays open before admitting a probe, milliseconds.
    pub circuit_breaker_timeout_ms: u64,
    /// Bounded request queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Overflow behavior.
    #[serde(default)]
    pub queue_overflow: QueueOverflow,
    /// Balancing strategy. Reserved: only "round-robin" exists and it
    /// degrades to identity with a single upstream per name.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 100,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 30_000,
            queue_capacity: default_queue_capacity(),
            queue_overflow: QueueOverflow::default(),
            strategy: default_strategy(),
        }
    }
}

/// Session manager configuration.
///
/// `Debug` is manually implemented to keep the auth token out of logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Idle timeout after which a session expires, milliseconds.
    pub session_timeout_ms: u64,
    /// Cap on concurrent sessions; the oldest idle session is evicted.
    pub max_sessions: usize,
    /// Bearer token required on HTTP/WebSocket surfaces when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 600_000,
            max_sessions: 256,
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("max_sessions", &self.max_sessions)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Name advertised in `serverInfo`.
    pub server_name: String,
    /// Interval between TTL/LRU/session sweeps, milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Bound on toolset loader awaits, milliseconds.
    #[serde(default = "default_loader_timeout_ms")]
    pub loader_timeout_ms: u64,
    /// When true, a backend that fails at startup aborts server start.
    #[serde(default)]
    pub require_tools: bool,
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_loader_timeout_ms() -> u64 {
    DEFAULT_LOADER_TIMEOUT_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "toolgate".to_string(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            loader_timeout_ms: DEFAULT_LOADER_TIMEOUT_MS,
            require_tools: false,
        }
    }
}

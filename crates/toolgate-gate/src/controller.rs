//! Tool gate controller.
//!
//! Owns the live map of active tools: which toolsets exist, which are
//! active, TTL expiry, LRU cap enforcement, pinning, and auto-activation on
//! first call to an owned tool.
//!
//! All gate state lives behind a single lock (the maps are coupled — no
//! fine-grained locking across them). The in-flight enable table sits in a
//! separate lock so that loader awaits never hold the state lock;
//! concurrent callers targeting the same toolset share one enablement
//! outcome through a `watch` barrier.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use toolgate_types::config::{matches_pattern, ConflictResolution, FilterConfig};
use toolgate_types::errors::GateError;
use toolgate_types::events::GateEvent;
use toolgate_types::tool::{ToolDescriptor, ToolsetManifest};
use toolgate_types::traits::{EventBus, ToolsetLoader};

use crate::filters::{FilterChain, FilterContext};
use crate::schema::optimize_descriptor;

/// Controller knobs, derived from the filter configuration.
#[derive(Debug, Clone)]
pub struct GateControllerConfig {
    /// TTL since last use for unpinned active toolsets, milliseconds.
    pub ttl_ms: u64,
    /// Cap on concurrently active toolsets; 0 = unlimited.
    pub max_active_toolsets: usize,
    /// Whether a call to an inactive tool may enable its owner.
    pub auto_enable_on_call: bool,
    /// Lowercase names when indexing/looking up owners.
    pub auto_enable_case_insensitive: bool,
    /// Owner selection when several toolsets claim a name.
    pub conflict_resolution: ConflictResolution,
    /// When non-empty, only matching names may auto-enable.
    pub allowlist: Vec<String>,
    /// Matching names never auto-enable.
    pub blocklist: Vec<String>,
    /// Bound on a loader await, milliseconds.
    pub loader_timeout_ms: u64,
}

impl From<&FilterConfig> for GateControllerConfig {
    fn from(config: &FilterConfig) -> Self {
        Self {
            ttl_ms: config.auto_disable_ttl_ms,
            max_active_toolsets: config.max_active_toolsets,
            auto_enable_on_call: config.auto_enable_on_call,
            auto_enable_case_insensitive: config.auto_enable_case_insensitive,
            conflict_resolution: config.auto_enable_conflict_resolution,
            allowlist: config.auto_enable_allowlist.clone(),
            blocklist: config.auto_enable_blocklist.clone(),
            loader_timeout_ms: toolgate_types::config::DEFAULT_LOADER_TIMEOUT_MS,
        }
    }
}

/// Per-toolset usage snapshot for `gate/usage_stats`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStat {
    /// Toolset id.
    pub toolset: String,
    /// Milliseconds since the toolset was last used.
    pub idle_ms: u64,
    /// Whether the toolset is pinned.
    pub pinned: bool,
    /// Number of tools the toolset provides.
    pub tool_count: usize,
}

struct RegisteredToolset {
    loader: Arc<dyn ToolsetLoader>,
    manifest: Option<ToolsetManifest>,
}

struct ActiveToolset {
    /// Optimized descriptors in load order.
    tools: Vec<ToolDescriptor>,
    /// Refreshed on activation and on every successful owned-tool call.
    last_used: Instant,
}

#[derive(Default)]
struct ControllerState {
    registered: HashMap<String, RegisteredToolset>,
    registration_order: Vec<String>,
    active: HashMap<String, ActiveToolset>,
    activation_order: Vec<String>,
    /// tool name → current owning toolset id (exactly one owner).
    owners: HashMap<String, String>,
    pinned: HashSet<String>,
    /// normalized tool name → potential owner ids, registration order.
    /// Built lazily from manifests / `expose_names` — never from loaders.
    reverse_index: Option<HashMap<String, Vec<String>>>,
}

/// Outcome shared with barrier waiters. Errors collapse to strings so the
/// outcome is cloneable; waiters surface them as [`GateError::Loader`].
type EnableOutcome = Result<Vec<String>, String>;

enum BarrierRole {
    Runner(watch::Sender<Option<EnableOutcome>>),
    Waiter(watch::Receiver<Option<EnableOutcome>>),
}

/// The gate controller.
pub struct GateController {
    config: GateControllerConfig,
    filter_chain: RwLock<FilterChain>,
    state: Mutex<ControllerState>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<EnableOutcome>>>>,
    events: Arc<dyn EventBus>,
}

impl GateController {
    /// Create a controller with the given knobs, filter chain, and bus.
    pub fn new(
        config: GateControllerConfig,
        filter_chain: FilterChain,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            filter_chain: RwLock::new(filter_chain),
            state: Mutex::new(ControllerState::default()),
            in_flight: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replace the filter chain (filter-config hot reload).
    pub async fn set_filter_chain(&self, chain: FilterChain) {
        *self.filter_chain.write().await = chain;
    }

    /// Register a toolset loader with an optional manifest sidecar.
    ///
    /// Re-registering an id replaces its loader and manifest. The reverse
    /// index is invalidated and rebuilt on next use.
    pub async fn register_toolset(
        &self,
        id: &str,
        loader: Arc<dyn ToolsetLoader>,
        manifest: Option<ToolsetManifest>,
    ) {
        let mut state = self.state.lock().await;
        if !state.registered.contains_key(id) {
            state.registration_order.push(id.to_string());
        }
        state
            .registered
            .insert(id.to_string(), RegisteredToolset { loader, manifest });
        state.reverse_index = None;
        debug!(toolset = %id, "registered toolset");
    }

    /// Ids of all registered toolsets, in registration order.
    pub async fn list_toolsets(&self) -> Vec<String> {
        self.state.lock().await.registration_order.clone()
    }

    /// Ids of currently active toolsets, in activation order.
    pub async fn active_toolsets(&self) -> Vec<String> {
        self.state.lock().await.activation_order.clone()
    }

    /// Whether a toolset is currently active.
    pub async fn is_active(&self, id: &str) -> bool {
        self.state.lock().await.active.contains_key(id)
    }

    /// Enable a toolset, loading it if necessary. Idempotent.
    ///
    /// Concurrent callers targeting the same toolset share one loader run:
    /// the first caller installs a barrier, runs the loader, and publishes
    /// the outcome; later callers wait on the barrier.
    ///
    /// Returns the names of the tools the toolset provides.
    pub async fn enable_toolset(&self, id: &str) -> Result<Vec<String>, GateError> {
        // Fast path without touching the barrier.
        {
            let state = self.state.lock().await;
            if let Some(active) = state.active.get(id) {
                return Ok(active.tools.iter().map(|t| t.name.clone()).collect());
            }
            if !state.registered.contains_key(id) {
                return Err(GateError::UnknownToolset(id.to_string()));
            }
        }

        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(id) {
                Some(rx) => BarrierRole::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(id.to_string(), rx);
                    BarrierRole::Runner(tx)
                }
            }
        };

        match role {
            BarrierRole::Waiter(mut rx) => {
                let outcome = rx
                    .wait_for(|o| o.is_some())
                    .await
                    .map_err(|_| GateError::Internal("enable barrier dropped".to_string()))?
                    .clone();
                match outcome {
                    Some(Ok(names)) => Ok(names),
                    Some(Err(message)) => Err(GateError::Loader(message)),
                    None => Err(GateError::Internal("enable barrier empty".to_string())),
                }
            }
            BarrierRole::Runner(tx) => {
                let result = self.enable_locked(id).await;
                // Remove the barrier before publishing so a retry after a
                // failure installs a fresh one.
                self.in_flight.lock().await.remove(id);
                let outcome: EnableOutcome = match &result {
                    Ok(names) => Ok(names.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(Some(outcome));
                result
            }
        }
    }

    /// The actual enable path run by the barrier owner.
    async fn enable_locked(&self, id: &str) -> Result<Vec<String>, GateError> {
        let loader = {
            let state = self.state.lock().await;
            if let Some(active) = state.active.get(id) {
                return Ok(active.tools.iter().map(|t| t.name.clone()).collect());
            }
            state
                .registered
                .get(id)
                .ok_or_else(|| GateError::UnknownToolset(id.to_string()))?
                .loader
                .clone()
        };

        let loaded = tokio::time::timeout(
            Duration::from_millis(self.config.loader_timeout_ms),
            loader.load(),
        )
        .await
        .map_err(|_| GateError::Timeout(format!("toolset loader '{id}' timed out")))??;

        let optimized: Vec<ToolDescriptor> =
            loaded.into_iter().map(optimize_descriptor).collect();

        let (names, lru_victims) = {
            let mut state = self.state.lock().await;

            // Collision check before any insertion: an enable aborts whole.
            let mut incoming = HashSet::new();
            for tool in &optimized {
                if let Some(owner) = state.owners.get(&tool.name) {
                    if owner != id {
                        return Err(GateError::Collision(format!(
                            "tool '{}' is already owned by active toolset '{}'",
                            tool.name, owner
                        )));
                    }
                }
                if !incoming.insert(tool.name.clone()) {
                    return Err(GateError::Collision(format!(
                        "toolset '{}' provides duplicate tool '{}'",
                        id, tool.name
                    )));
                }
            }

            for tool in &optimized {
                state.owners.insert(tool.name.clone(), id.to_string());
            }
            let names: Vec<String> = optimized.iter().map(|t| t.name.clone()).collect();
            state.active.insert(
                id.to_string(),
                ActiveToolset {
                    tools: optimized,
                    last_used: Instant::now(),
                },
            );
            state.activation_order.push(id.to_string());

            let victims = Self::lru_victims(&state, self.config.max_active_toolsets);
            (names, victims)
        };

        info!(toolset = %id, tools = names.len(), "toolset enabled");

        for victim in lru_victims {
            if self.disable_inner(&victim).await.is_some() {
                info!(toolset = %victim, "toolset evicted by LRU cap");
                self.events
                    .publish(GateEvent::AutoDisableLru { toolset: victim });
            }
        }

        Ok(names)
    }

    /// Victim ids when the active count exceeds the cap: oldest unpinned
    /// first, repeatedly, until within the cap or only pinned remain.
    fn lru_victims(state: &ControllerState, max_active: usize) -> Vec<String> {
        if max_active == 0 {
            return Vec::new();
        }
        let mut victims = Vec::new();
        let mut remaining: Vec<&String> = state
            .activation_order
            .iter()
            .filter(|id| !state.pinned.contains(*id))
            .collect();

        let mut active_count = state.active.len();
        while active_count > max_active {
            // Oldest by last_used; activation order breaks exact ties.
            let Some(pos) = remaining
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| state.active.get(id.as_str()).map(|a| a.last_used))
                .map(|(pos, _)| pos)
            else {
                break;
            };
            victims.push(remaining.remove(pos).clone());
            active_count -= 1;
        }
        victims
    }

    /// Disable a toolset, removing every descriptor it provided. Idempotent;
    /// explicitly allowed on pinned toolsets (pin prevents automatic
    /// disable only). Returns the removed tool names.
    pub async fn disable_toolset(&self, id: &str) -> Result<Vec<String>, GateError> {
        Ok(self.disable_inner(id).await.unwrap_or_default())
    }

    /// Remove a toolset from the active state. `None` when it was not
    /// active.
    async fn disable_inner(&self, id: &str) -> Option<Vec<String>> {
        let mut state = self.state.lock().await;
        let removed = state.active.remove(id)?;
        state.activation_order.retain(|other| other != id);
        let names: Vec<String> = removed.tools.iter().map(|t| t.name.clone()).collect();
        for name in &names {
            if state.owners.get(name).is_some_and(|owner| owner == id) {
                state.owners.remove(name);
            }
        }
        info!(toolset = %id, tools = names.len(), "toolset disabled");
        Some(names)
    }

    /// Refresh the owning toolset's `last_used` for a successful tool call.
    pub async fn mark_used(&self, tool_name: &str) {
        let mut state = self.state.lock().await;
        let Some(owner) = state.owners.get(tool_name).cloned() else {
            return;
        };
        if let Some(active) = state.active.get_mut(&owner) {
            active.last_used = Instant::now();
        }
    }

    /// Make a tool callable now, auto-enabling its owner when policy allows.
    ///
    /// Returns whether the tool is available after the call. Loader
    /// failures are logged and surface as `false` (the caller reports
    /// tool-not-found); the manifest-based index stays intact for later
    /// attempts.
    pub async fn ensure_tool_available(&self, tool_name: &str) -> Result<bool, GateError> {
        // Already active: refresh usage and done.
        {
            let mut state = self.state.lock().await;
            if let Some(owner) = state.owners.get(tool_name).cloned() {
                if let Some(active) = state.active.get_mut(&owner) {
                    active.last_used = Instant::now();
                }
                return Ok(true);
            }
        }

        let normalized = self.normalize(tool_name);
        let candidates = {
            let mut state = self.state.lock().await;
            self.build_reverse_index(&mut state);
            match state
                .reverse_index
                .as_ref()
                .and_then(|index| index.get(&normalized))
            {
                Some(owners) => owners.clone(),
                None => return Ok(false),
            }
        };
        if candidates.is_empty() {
            return Ok(false);
        }

        let target = match self.config.conflict_resolution {
            ConflictResolution::PreferEnabled => {
                let state = self.state.lock().await;
                candidates
                    .iter()
                    .find(|id| state.active.contains_key(*id))
                    .unwrap_or(&candidates[0])
                    .clone()
            }
            ConflictResolution::FirstMatch => candidates[0].clone(),
            ConflictResolution::Error => {
                if candidates.len() > 1 {
                    return Err(GateError::Ambiguous(format!(
                        "tool '{}' is claimed by {} toolsets: {}",
                        tool_name,
                        candidates.len(),
                        candidates.join(", ")
                    )));
                }
                candidates[0].clone()
            }
        };

        if !self.config.auto_enable_on_call {
            return Ok(false);
        }
        if self
            .config
            .blocklist
            .iter()
            .any(|p| matches_pattern(&self.normalize(p), &normalized))
        {
            debug!(tool = %tool_name, "auto-enable blocked by blocklist");
            return Ok(false);
        }
        if !self.config.allowlist.is_empty()
            && !self
                .config
                .allowlist
                .iter()
                .any(|p| matches_pattern(&self.normalize(p), &normalized))
        {
            debug!(tool = %tool_name, "auto-enable not covered by allowlist");
            return Ok(false);
        }

        match self.enable_toolset(&target).await {
            Ok(names) => {
                // A manifest may claim names its loader never produced;
                // availability is judged from what actually loaded.
                let available = names.iter().any(|n| self.normalize(n) == normalized);
                if available {
                    info!(toolset = %target, tool = %tool_name, "toolset auto-enabled on call");
                    self.events.publish(GateEvent::AutoEnable {
                        toolset: target,
                        tool: tool_name.to_string(),
                    });
                } else {
                    warn!(
                        toolset = %target,
                        tool = %tool_name,
                        "toolset enabled but does not provide the requested tool"
                    );
                }
                Ok(available)
            }
            Err(e) => {
                warn!(toolset = %target, tool = %tool_name, error = %e, "auto-enable failed");
                Ok(false)
            }
        }
    }

    /// Disable every active, unpinned toolset idle past the TTL.
    ///
    /// Victims are snapshotted first, then disabled one by one; the state
    /// lock is never held across I/O. Returns the disabled ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let victims: Vec<String> = {
            let state = self.state.lock().await;
            state
                .activation_order
                .iter()
                .filter(|id| {
                    !state.pinned.contains(*id)
                        && state
                            .active
                            .get(*id)
                            .is_some_and(|a| a.last_used.elapsed() >= ttl)
                })
                .cloned()
                .collect()
        };

        let mut disabled = Vec::new();
        for victim in victims {
            if self.disable_inner(&victim).await.is_some() {
                info!(toolset = %victim, "toolset expired by TTL");
                self.events.publish(GateEvent::AutoDisableTtl {
                    toolset: victim.clone(),
                });
                disabled.push(victim);
            }
        }
        disabled
    }

    /// Disable oldest unpinned toolsets until within the active cap.
    /// Returns the disabled ids.
    pub async fn enforce_lru_cap(&self) -> Vec<String> {
        let victims = {
            let state = self.state.lock().await;
            Self::lru_victims(&state, self.config.max_active_toolsets)
        };
        let mut disabled = Vec::new();
        for victim in victims {
            if self.disable_inner(&victim).await.is_some() {
                info!(toolset = %victim, "toolset evicted by LRU cap");
                self.events.publish(GateEvent::AutoDisableLru {
                    toolset: victim.clone(),
                });
                disabled.push(victim);
            }
        }
        disabled
    }

    /// Pin a toolset, exempting it from TTL and LRU eviction. Pinning a
    /// not-yet-enabled toolset is allowed.
    pub async fn pin(&self, id: &str) {
        self.state.lock().await.pinned.insert(id.to_string());
    }

    /// Remove a pin.
    pub async fn unpin(&self, id: &str) {
        self.state.lock().await.pinned.remove(id);
    }

    /// The currently pinned ids, sorted.
    pub async fn pinned(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.pinned.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Usage snapshot per active toolset, in activation order.
    pub async fn usage_stats(&self) -> Vec<UsageStat> {
        let state = self.state.lock().await;
        state
            .activation_order
            .iter()
            .filter_map(|id| {
                state.active.get(id).map(|active| UsageStat {
                    toolset: id.clone(),
                    idle_ms: active.last_used.elapsed().as_millis() as u64,
                    pinned: state.pinned.contains(id),
                    tool_count: active.tools.len(),
                })
            })
            .collect()
    }

    /// The filtered view of active tools for a request context.
    pub async fn available_tools(&self, ctx: &FilterContext) -> Vec<ToolDescriptor> {
        let view = {
            let state = self.state.lock().await;
            let mut view = Vec::new();
            for id in &state.activation_order {
                if let Some(active) = state.active.get(id) {
                    view.extend(active.tools.iter().cloned());
                }
            }
            view
        };
        self.filter_chain.read().await.apply(view, ctx)
    }

    /// Look up an active tool by exact name.
    pub async fn active_tool(&self, name: &str) -> Option<ToolDescriptor> {
        let state = self.state.lock().await;
        let owner = state.owners.get(name)?;
        state
            .active
            .get(owner)
            .and_then(|active| active.tools.iter().find(|t| t.name == name))
            .cloned()
    }

    /// Look up an active tool, falling back to a case-folded match when
    /// the controller runs case-insensitive.
    pub async fn resolve_active_tool(&self, name: &str) -> Option<ToolDescriptor> {
        if let Some(tool) = self.active_tool(name).await {
            return Some(tool);
        }
        if !self.config.auto_enable_case_insensitive {
            return None;
        }
        let wanted = name.to_lowercase();
        let state = self.state.lock().await;
        let (stored_name, owner_id) = state
            .owners
            .iter()
            .find(|(stored, _)| stored.to_lowercase() == wanted)
            .map(|(stored, owner)| (stored.clone(), owner.clone()))?;
        state
            .active
            .get(&owner_id)
            .and_then(|active| active.tools.iter().find(|t| t.name == stored_name))
            .cloned()
    }

    /// Names of every active tool, unfiltered, in activation order.
    pub async fn active_tool_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names = Vec::new();
        for id in &state.activation_order {
            if let Some(active) = state.active.get(id) {
                names.extend(active.tools.iter().map(|t| t.name.clone()));
            }
        }
        names
    }

    fn normalize(&self, name: &str) -> String {
        if self.config.auto_enable_case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Build the reverse index from manifests / `expose_names` if absent.
    /// Loaders are never run here.
    fn build_reverse_index(&self, state: &mut ControllerState) {
        if state.reverse_index.is_some() {
            return;
        }
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for id in &state.registration_order {
            let Some(registered) = state.registered.get(id) else {
                continue;
            };
            let names: Option<Vec<String>> = registered
                .manifest
                .as_ref()
                .map(|m| m.tools.clone())
                .or_else(|| registered.loader.expose_names());
            let Some(names) = names else {
                continue;
            };
            for name in names {
                let entry = index.entry(self.normalize(&name)).or_default();
                if !entry.contains(id) {
                    entry.push(id.clone());
                }
            }
        }
        debug!(entries = index.len(), "built reverse index from manifests");
        state.reverse_index = Some(index);
    }
}

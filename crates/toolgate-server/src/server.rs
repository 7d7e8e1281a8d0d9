//! Server wiring.
//!
//! Assembles the repository, gate controller, gating service, client
//! manager, proxy service, sessions, load balancer, and router into one
//! serving process; hosts the stdio and HTTP/WebSocket surfaces; and runs
//! the periodic sweep (toolset TTL, LRU cap, session expiry).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use toolgate_gate::controller::{GateController, GateControllerConfig};
use toolgate_gate::discovery::GatingService;
use toolgate_gate::filters::FilterChain;
use toolgate_gate::repository::ToolRepository;
use toolgate_proxy::manager::ClientManager;
use toolgate_proxy::service::ProxyService;
use toolgate_proxy::transport::{HttpServerTransport, StdioTransport};
use toolgate_types::config::{FilterConfig, LoadBalancerConfig, ServerConfig, SessionConfig};
use toolgate_types::errors::GateError;
use toolgate_types::tool::{BackendConfig, ToolDescriptor, ToolsetManifest};
use toolgate_types::traits::{EventBus, ToolsetLoader, Transport};

use crate::load_balancer::LoadBalancer;
use crate::router::{forward_notifications, McpRouter};
use crate::session::SessionManager;

/// A toolset backed by one backend's `tools/list` catalogue.
///
/// The loader is the expensive path (a live backend round trip); the
/// manifest names are the cheap path used by the gate's reverse index.
pub struct BackendToolsetLoader {
    manager: Arc<ClientManager>,
    backend: String,
    exposed: Option<Vec<String>>,
}

impl BackendToolsetLoader {
    /// Loader for a backend, with optional cheap name metadata.
    pub fn new(manager: Arc<ClientManager>, backend: &str, exposed: Option<Vec<String>>) -> Self {
        Self {
            manager,
            backend: backend.to_string(),
            exposed,
        }
    }
}

#[async_trait]
impl ToolsetLoader for BackendToolsetLoader {
    async fn load(&self) -> Result<Vec<ToolDescriptor>, GateError> {
        self.manager.list_tools(&self.backend).await
    }

    fn expose_names(&self) -> Option<Vec<String>> {
        self.exposed.clone()
    }
}

fn lock<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The assembled MCP proxy server.
pub struct McpServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    balancer: Arc<LoadBalancer>,
    gate: Arc<GateController>,
    repository: Arc<RwLock<ToolRepository>>,
    manager: Arc<ClientManager>,
    proxy: Arc<ProxyService>,
    router: Arc<McpRouter>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl McpServer {
    /// Wire a server from its configuration and an injected event bus.
    pub fn new(
        config: ServerConfig,
        session_config: SessionConfig,
        balancer_config: LoadBalancerConfig,
        filter_config: FilterConfig,
        events: Arc<dyn EventBus>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(session_config));
        let balancer = Arc::new(LoadBalancer::new(balancer_config));

        let mut gate_config = GateControllerConfig::from(&filter_config);
        gate_config.loader_timeout_ms = config.loader_timeout_ms;
        let gate = Arc::new(GateController::new(
            gate_config,
            FilterChain::from_config(&filter_config),
            events.clone(),
        ));

        let repository = Arc::new(RwLock::new(ToolRepository::new()));
        let manager = Arc::new(ClientManager::new(events.clone()));
        let proxy = Arc::new(ProxyService::new(manager.clone(), events.clone()));
        let gating = Arc::new(GatingService::new(events));

        let router = Arc::new(McpRouter::new(
            config.server_name.clone(),
            sessions.clone(),
            balancer.clone(),
            gate.clone(),
            gating,
            repository.clone(),
            proxy.clone(),
        ));

        Self {
            config,
            sessions,
            balancer,
            gate,
            repository,
            manager,
            proxy,
            router,
            sweeper: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// The method router (also the request handler for external hosts).
    pub fn router(&self) -> Arc<McpRouter> {
        self.router.clone()
    }

    /// The gate controller.
    pub fn gate(&self) -> Arc<GateController> {
        self.gate.clone()
    }

    /// The backend client manager.
    pub fn manager(&self) -> Arc<ClientManager> {
        self.manager.clone()
    }

    /// Wire a server whose filter configuration comes from the file named
    /// by the `TOOL_FILTER_CONFIG` environment variable.
    ///
    /// Returns the server plus the config loader and change receiver; pass
    /// the receiver to [`McpServer::spawn_filter_reload`] (after calling
    /// `watch()` on the loader) for hot reload.
    pub fn from_env(
        config: ServerConfig,
        session_config: SessionConfig,
        balancer_config: LoadBalancerConfig,
        events: Arc<dyn EventBus>,
    ) -> Result<
        (
            Self,
            toolgate_types::config_loader::FilterConfigLoader,
            tokio::sync::watch::Receiver<FilterConfig>,
        ),
        GateError,
    > {
        let (loader, rx) = toolgate_types::config_loader::FilterConfigLoader::from_env()?;
        let filter_config = rx.borrow().clone();
        let server = Self::new(config, session_config, balancer_config, filter_config, events);
        Ok((server, loader, rx))
    }

    /// Swap the filter chain (filter-config hot reload).
    pub async fn apply_filter_config(&self, filter_config: &FilterConfig) {
        self.gate
            .set_filter_chain(FilterChain::from_config(filter_config))
            .await;
        info!("filter configuration applied");
    }

    /// Apply every filter-config update broadcast on the channel.
    pub fn spawn_filter_reload(
        &self,
        mut rx: tokio::sync::watch::Receiver<FilterConfig>,
    ) {
        let gate = self.gate.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let filter_config = rx.borrow().clone();
                gate.set_filter_chain(FilterChain::from_config(&filter_config))
                    .await;
                info!("filter configuration hot-reloaded");
            }
        });
        lock(&self.forwarders).push(task);
    }

    /// Connect one backend and register it as a toolset.
    ///
    /// The backend's catalogue lands in the repository (for discovery) and
    /// in the proxy registry (for dispatch); the toolset stays unloaded
    /// until enabled through the gate.
    pub async fn register_backend(
        &self,
        config: BackendConfig,
        manifest: Option<ToolsetManifest>,
    ) -> Result<(), GateError> {
        let name = config.name.clone();
        self.manager.connect(config).await?;
        self.index_backend(&name, manifest).await
    }

    /// [`McpServer::register_backend`] over an explicit transport.
    pub async fn register_backend_with_transport(
        &self,
        config: BackendConfig,
        transport: Arc<dyn Transport>,
        manifest: Option<ToolsetManifest>,
    ) -> Result<(), GateError> {
        let name = config.name.clone();
        self.manager.connect_with_transport(config, transport).await?;
        self.index_backend(&name, manifest).await
    }

    async fn index_backend(
        &self,
        name: &str,
        manifest: Option<ToolsetManifest>,
    ) -> Result<(), GateError> {
        let tools = self.manager.list_tools(name).await?;

        {
            let mut repository = self.repository.write().await;
            for tool in &tools {
                if let Err(e) = repository.add_tool(tool.clone()) {
                    warn!(backend = %name, tool = %tool.name, error = %e, "not indexing tool");
                }
            }
        }
        for tool in &tools {
            if let Err(e) = self.proxy.add_tool(tool.clone()).await {
                warn!(backend = %name, tool = %tool.name, error = %e, "not registering tool");
            }
        }

        let exposed = manifest
            .as_ref()
            .map(|m| m.tools.clone())
            .or_else(|| Some(tools.iter().map(|t| t.name.clone()).collect()));
        let loader = Arc::new(BackendToolsetLoader::new(
            self.manager.clone(),
            name,
            exposed,
        ));
        self.gate.register_toolset(name, loader, manifest).await;
        info!(backend = %name, tools = tools.len(), "backend registered as toolset");
        Ok(())
    }

    /// Register every configured backend.
    ///
    /// Failures are logged and skipped unless `require_tools` is set, in
    /// which case the first failure aborts startup.
    pub async fn register_backends(
        &self,
        backends: Vec<(BackendConfig, Option<ToolsetManifest>)>,
    ) -> Result<usize, GateError> {
        let mut registered = 0;
        for (config, manifest) in backends {
            let name = config.name.clone();
            match self.register_backend(config, manifest).await {
                Ok(()) => registered += 1,
                Err(e) if self.config.require_tools => {
                    return Err(GateError::Config(format!(
                        "backend '{name}' failed and requireTools is set: {e}"
                    )));
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "backend skipped at startup");
                }
            }
        }
        Ok(registered)
    }

    /// Serve newline-delimited JSON over the process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<(), GateError> {
        self.serve_transport(Arc::new(StdioTransport::stdio())).await
    }

    /// Serve HTTP (`POST /`) and WebSocket (`GET /ws`) on an address.
    /// Returns the bound address.
    pub async fn serve_http(
        &self,
        addr: SocketAddr,
        auth_token: Option<String>,
    ) -> Result<SocketAddr, GateError> {
        let transport = Arc::new(HttpServerTransport::new(addr).with_auth_token(auth_token));
        let bound = {
            self.serve_transport(transport.clone()).await?;
            transport
                .local_addr()
                .ok_or_else(|| GateError::Internal("listener has no bound address".to_string()))?
        };
        Ok(bound)
    }

    /// Start one serving surface: handler, notification forwarding, start.
    pub async fn serve_transport(&self, transport: Arc<dyn Transport>) -> Result<(), GateError> {
        transport.set_request_handler(self.router.clone());
        transport.start().await?;

        let forwarder = tokio::spawn(forward_notifications(
            self.router.subscribe_notifications(),
            transport.clone(),
        ));
        lock(&self.forwarders).push(forwarder);
        lock(&self.transports).push(transport);
        Ok(())
    }

    /// Start the periodic sweep: toolset TTL, LRU cap, session expiry.
    ///
    /// Victims are snapshotted and disabled one by one; the gate lock is
    /// never held across I/O. A sweep that disabled anything announces
    /// `tools.listChanged` afterwards.
    pub fn spawn_sweeper(&self) {
        let gate = self.gate.clone();
        let sessions = self.sessions.clone();
        let router = self.router.clone();
        let interval = Duration::from_millis(self.config.sweep_interval_ms);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh server
            // does not sweep before anything happened.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = gate.sweep_expired().await;
                let evicted = gate.enforce_lru_cap().await;
                if !expired.is_empty() || !evicted.is_empty() {
                    info!(
                        expired = expired.len(),
                        evicted = evicted.len(),
                        "sweep disabled toolsets"
                    );
                    router.notify_tools_changed();
                }
                let sessions_removed = sessions.sweep_expired().await;
                if !sessions_removed.is_empty() {
                    info!(count = sessions_removed.len(), "sweep expired sessions");
                }
            }
        });
        *lock(&self.sweeper) = Some(task);
    }

    /// Current load-balancer metrics.
    pub fn metrics(&self) -> crate::load_balancer::LoadBalancerMetrics {
        self.balancer.metrics()
    }

    /// Stop serving: sweeper, surfaces, then backend connections. Pending
    /// requests on stopped transports reject with "Transport stopped".
    pub async fn shutdown(&self) {
        if let Some(task) = lock(&self.sweeper).take() {
            task.abort();
        }
        for task in lock(&self.forwarders).drain(..) {
            task.abort();
        }
        let transports: Vec<Arc<dyn Transport>> = lock(&self.transports).drain(..).collect();
        for transport in transports {
            if let Err(e) = transport.stop().await {
                warn!(error = %e, "transport stop failed");
            }
        }
        for backend in self.manager.backends().await {
            let _ = self.manager.disconnect(&backend).await;
        }
        info!("server shut down");
    }
}

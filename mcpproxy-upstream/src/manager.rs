//! Fleet manager for upstream clients
//!
//! Owns the `name -> client` map, orchestrates the two-phase startup dial,
//! runs the periodic reconnect sweep and the OAuth-event monitor, and
//! routes `"server:tool"` calls to the owning client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use mcpproxy_config::{ProxyConfig, ServerConfig};
use mcpproxy_interfaces::{OAuthEventQueue, ServerAutoDisableCallback};

use crate::client::{ClientDeps, DiscoveredTool, UpstreamClient};
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::ToolsCallResult;
use crate::state::{ConnectionInfo, ServerState};

/// Aggregating manager over one client per upstream server
pub struct UpstreamManager {
    deps: ClientDeps,
    backoff: mcpproxy_config::BackoffConfig,
    timeouts: mcpproxy_config::Timeouts,
    clients: RwLock<HashMap<String, Arc<UpstreamClient>>>,
    auto_disable_cb: StdMutex<Option<ServerAutoDisableCallback>>,
    oauth_queue: Option<Arc<dyn OAuthEventQueue>>,
    /// Last token-detection reconnect per server, for the cooldown
    token_retry_at: Mutex<HashMap<String, tokio::time::Instant>>,
    monitors: StdMutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl UpstreamManager {
    pub fn new(config: &ProxyConfig, deps: ClientDeps) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            backoff: config.backoff.clone(),
            timeouts: config.timeouts.clone(),
            deps,
            clients: RwLock::new(HashMap::new()),
            auto_disable_cb: StdMutex::new(None),
            oauth_queue: None,
            token_retry_at: Mutex::new(HashMap::new()),
            monitors: StdMutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Attach the queue of OAuth completions persisted by external flows
    pub fn with_oauth_queue(mut self: Arc<Self>, queue: Arc<dyn OAuthEventQueue>) -> Arc<Self> {
        // Builder-style; only valid before any monitor starts
        if let Some(manager) = Arc::get_mut(&mut self) {
            manager.oauth_queue = Some(queue);
        } else {
            tracing::warn!("oauth queue attached after manager was shared; ignored");
        }
        self
    }

    /// Callback fired when a client auto-disables its server. The embedder
    /// persists the flip and suppresses its own file-watcher reload.
    pub fn set_server_auto_disable_callback(&self, callback: ServerAutoDisableCallback) {
        *self
            .auto_disable_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback.clone());

        // Propagate to clients that already exist
        if let Ok(clients) = self.clients.try_read() {
            for client in clients.values() {
                client.set_auto_disable_callback(callback.clone());
            }
        }
    }

    // === Fleet membership ===

    /// Register (or replace) a server. Replacing a running server
    /// disconnects the old client; the caller decides when to re-dial.
    pub async fn add_server(&self, config: ServerConfig) -> UpstreamResult<()> {
        validate_server_name(&config.name)?;

        let was_running = {
            let clients = self.clients.read().await;
            clients
                .get(&config.name)
                .map(|existing| existing.is_connected() || existing.is_connecting())
        };

        if let Some(running) = was_running {
            tracing::info!(server = %config.name, "replacing existing server registration");
            if running {
                if let Some(old) = self.clients.read().await.get(&config.name).cloned() {
                    old.stop().await;
                }
            }
        }

        let client = UpstreamClient::new(config.clone(), self.deps.clone());

        // Map persisted flags onto the server state machine
        let initial_state = if config.quarantined {
            ServerState::Quarantined
        } else if config.auto_disabled {
            ServerState::AutoDisabled
        } else if !config.enabled {
            ServerState::Disabled
        } else if !config.start_on_boot {
            ServerState::LazyLoading
        } else {
            ServerState::Active
        };
        client.state_manager().set_server_state(initial_state);
        if config.auto_disabled {
            client
                .state_manager()
                .restore_auto_disabled(config.auto_disable_reason.clone().unwrap_or_default());
        }

        let callback = self
            .auto_disable_cb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            client.set_auto_disable_callback(callback);
        }

        let replaced_running = {
            let mut clients = self.clients.write().await;
            let replaced = clients.insert(config.name.clone(), client.clone());
            replaced.is_some() && was_running == Some(true)
        };

        // A replaced running server reconnects with the new configuration
        if replaced_running && eligible_for_dial(&config) {
            let _ = client.connect().await;
        }

        Ok(())
    }

    /// Disconnect and remove a server
    pub async fn remove_server(&self, name: &str) -> bool {
        let client = self.clients.write().await.remove(name);
        match client {
            Some(client) => {
                client.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Connection snapshots for every registered server
    pub async fn list_servers(&self) -> Vec<(String, ConnectionInfo)> {
        let clients = self.clients.read().await;
        let mut servers: Vec<_> = clients
            .iter()
            .map(|(name, client)| (name.clone(), client.connection_info()))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        servers
    }

    /// All tools discovered across the fleet, by public name
    pub async fn list_tools(&self) -> Vec<DiscoveredTool> {
        let clients = self.clients.read().await;
        let mut tools = Vec::new();
        for client in clients.values() {
            tools.extend(client.list_tools().iter().cloned());
        }
        tools.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        tools
    }

    // === Startup orchestration ===

    /// Two-phase startup: a bounded parallel dial of every eligible
    /// server, then exponential-backoff retry rounds over the failures.
    pub async fn connect_all(self: &Arc<Self>) -> UpstreamResult<()> {
        let eligible: Vec<Arc<UpstreamClient>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| eligible_for_dial(client.config()))
                .cloned()
                .collect()
        };

        if eligible.is_empty() {
            tracing::info!("no servers eligible for startup dial");
            return Ok(());
        }

        tracing::info!(count = eligible.len(), "dialing upstream servers");

        // Phase 1: bounded parallel dial
        let mut failed = self.dial_round(eligible).await;

        // Phase 2: exponential retry of the failed set
        let mut attempt = 1u32;
        while !failed.is_empty() && attempt <= self.backoff.startup_retry_attempts {
            let delay = startup_retry_delay(attempt, self.backoff.per_retry_cap);
            tracing::info!(
                attempt,
                failed = failed.len(),
                delay = ?delay,
                "retrying failed upstream dials"
            );
            tokio::time::sleep(delay).await;

            failed = self.dial_round(failed).await;
            attempt += 1;
        }

        // Whatever still fails gets the persistent-failure treatment
        for client in failed {
            self.handle_persistent_failure(&client).await;
        }

        Ok(())
    }

    /// Dial a set of clients in parallel, bounded by the startup
    /// semaphore. Returns the clients that failed.
    async fn dial_round(
        self: &Arc<Self>,
        clients: Vec<Arc<UpstreamClient>>,
    ) -> Vec<Arc<UpstreamClient>> {
        let semaphore = Arc::new(Semaphore::new(self.backoff.startup_concurrency));
        let connect_timeout = self.timeouts.connect;
        let mut join_set = JoinSet::new();

        for client in clients {
            // Startup deduplication: a concurrent reload may have already
            // connected this server, or an earlier round disabled it
            if client.is_connected()
                || client.is_connecting()
                || client.state_manager().is_auto_disabled()
            {
                continue;
            }

            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result =
                    tokio::time::timeout(connect_timeout, client.connect()).await;
                let ok = matches!(result, Ok(Ok(())));
                if !ok {
                    tracing::warn!(
                        server = %client.server_name(),
                        "startup dial failed"
                    );
                }
                (client, ok)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((client, ok)) => {
                    if !ok {
                        failed.push(client);
                    }
                }
                Err(e) => tracing::error!("startup dial task panicked: {}", e),
            }
        }
        failed
    }

    /// A server that survived every startup retry round: log it, disable
    /// it if the threshold is crossed, and tear it down.
    async fn handle_persistent_failure(&self, client: &Arc<UpstreamClient>) {
        let info = client.connection_info();
        let message = format!(
            "server failed all {} startup attempts; last error: {}",
            self.backoff.startup_retry_attempts + 1,
            info.last_error.as_deref().unwrap_or("unknown")
        );
        tracing::error!(server = %client.server_name(), "{}", message);

        self.deps
            .failure_log
            .log_detailed(
                &self.deps.failure_log_dir,
                client.server_name(),
                &message,
                "connection",
                info.consecutive_failures,
                info.first_attempt_time,
            )
            .await;

        // The dial rounds already counted each failure; this fires the
        // callback only if the threshold has been crossed by now.
        let err = UpstreamError::connection_failed(message);
        client.enforce_auto_disable(&err).await;
        client.disconnect().await;
    }

    // === Tool routing ===

    /// Split `"server:tool"` on the first `:` and dispatch to the client
    pub async fn call_tool(
        &self,
        public_name: &str,
        arguments: serde_json::Value,
    ) -> UpstreamResult<ToolsCallResult> {
        let (server, tool) = public_name.split_once(':').ok_or_else(|| {
            UpstreamError::configuration(format!(
                "tool name '{}' is not of the form 'server:tool'",
                public_name
            ))
        })?;

        let client = self.get_client(server).await.ok_or_else(|| {
            UpstreamError::ToolNotFound {
                tool_name: format!("{} (no server named '{}')", public_name, server),
            }
        })?;

        client.call_tool(tool, arguments).await
    }

    /// Manual reconnect trigger; bypasses backoff for one attempt
    pub async fn retry_connection(&self, name: &str) -> UpstreamResult<()> {
        let client = self.get_client(name).await.ok_or_else(|| {
            UpstreamError::configuration(format!("no server named '{}'", name))
        })?;
        client.reconnect().await.map(|_| ())
    }

    // === Background monitors ===

    /// Start the reconnect sweep and the OAuth-event monitor
    pub fn start_monitors(self: &Arc<Self>) {
        let mut monitors = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !monitors.is_empty() {
            return;
        }

        monitors.push(self.spawn_health_monitor());
        monitors.push(self.spawn_oauth_monitor());
    }

    /// Stop monitors and disconnect every client
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        let clients: Vec<_> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            client.stop().await;
        }
        tracing::info!("upstream manager shut down");
    }

    fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.backoff.manager_health_interval;
        let connect_timeout = self.timeouts.connect;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let Some(manager) = manager.upgrade() else { break };
                manager.health_sweep(connect_timeout).await;
            }
        })
    }

    /// Reconnect servers that opted into health checks and fell offline
    async fn health_sweep(self: &Arc<Self>, connect_timeout: Duration) {
        let clients: Vec<_> = {
            let clients = self.clients.read().await;
            clients.values().cloned().collect()
        };

        for client in clients {
            let config = client.config();
            if !config.health_check || !eligible_for_dial(config) {
                continue;
            }
            let state = client.state_manager();
            if state.is_auto_disabled() || state.is_user_stopped() {
                continue;
            }
            if client.is_connected() || client.is_connecting() {
                continue;
            }

            match tokio::time::timeout(connect_timeout, client.reconnect()).await {
                Ok(Ok(true)) => {
                    tracing::info!(server = %client.server_name(), "health sweep reconnected server")
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(server = %client.server_name(), "health sweep reconnect failed: {}", e)
                }
                Err(_) => {
                    tracing::warn!(server = %client.server_name(), "health sweep reconnect timed out")
                }
            }
        }
    }

    fn spawn_oauth_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.backoff.oauth_monitor_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let Some(manager) = manager.upgrade() else { break };
                manager.oauth_sweep().await;
            }
        })
    }

    /// Scan external OAuth completions and the token store for servers
    /// stuck in OAuth error, and reconnect them.
    async fn oauth_sweep(self: &Arc<Self>) {
        // (a) completions persisted by external auth flows
        if let Some(queue) = &self.oauth_queue {
            for completion in queue.drain().await {
                let Some(client) = self.get_client(&completion.server_name).await else {
                    tracing::debug!(
                        server = %completion.server_name,
                        "oauth completion for unknown server"
                    );
                    continue;
                };
                if client.is_connected() || client.is_connecting() {
                    continue;
                }
                tracing::info!(server = %client.server_name(), "external authorization completed; reconnecting");
                self.spawn_reconnect(client);
            }
        }

        // (b) a token appearing for a server in OAuth error means a flow
        // finished somewhere; reconnect without waiting out the backoff
        let candidates: Vec<_> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| {
                    client.state_manager().is_oauth_error()
                        && !client.is_connected()
                        && !client.is_connecting()
                        && !client.state_manager().is_auto_disabled()
                })
                .cloned()
                .collect()
        };

        for client in candidates {
            let name = client.server_name().to_string();

            // Cooldown: a token write can race a read; do not spin
            {
                let mut last = self.token_retry_at.lock().await;
                if let Some(at) = last.get(&name) {
                    if at.elapsed() < self.backoff.token_reconnect_cooldown {
                        continue;
                    }
                }
                last.insert(name.clone(), tokio::time::Instant::now());
            }

            match self.deps.token_store.get(&name).await {
                Ok(Some(token)) if !token.is_expired() => {
                    tracing::info!(server = %name, "token detected; reconnecting");
                    self.spawn_reconnect(client);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(server = %name, "token store read failed: {}", e),
            }
        }
    }

    fn spawn_reconnect(&self, client: Arc<UpstreamClient>) {
        tokio::spawn(async move {
            if let Err(e) = client.reconnect().await {
                tracing::warn!(server = %client.server_name(), "reconnect failed: {}", e);
            }
        });
    }
}

/// Startup dial eligibility: enabled, not quarantined, not auto-disabled,
/// and not deferred to first use
fn eligible_for_dial(config: &ServerConfig) -> bool {
    config.enabled && !config.quarantined && !config.auto_disabled && config.start_on_boot
}

/// Delay before startup retry round `attempt` (1-indexed)
fn startup_retry_delay(attempt: u32, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let delay = Duration::from_secs(1u64 << shift);
    delay.min(cap)
}

fn validate_server_name(name: &str) -> UpstreamResult<()> {
    if name.is_empty() {
        return Err(UpstreamError::configuration("server name cannot be empty"));
    }
    if name.contains(':') {
        return Err(UpstreamError::configuration(format!(
            "server name '{}' must not contain ':'",
            name
        )));
    }
    Ok(())
}

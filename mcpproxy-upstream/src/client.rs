//! Per-upstream MCP client
//!
//! Binds a transport to a [`StateManager`]: performs the initialize
//! handshake (with OAuth when the server demands it), discovers tools,
//! executes tool calls, runs a supervisor loop, and reconnects serially.
//! At most one reconnection attempt is ever in flight per client.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use mcpproxy_config::{BackoffConfig, ServerConfig, Timeouts};
use mcpproxy_interfaces::{
    EventBus, FailureLog, ServerAutoDisableCallback, TokenStore,
};

use crate::error::{UpstreamError, UpstreamResult};
use crate::oauth::OAuthFlow;
use crate::protocol::{
    methods, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, ToolsCallParams,
    ToolsCallResult, ToolsListParams, ToolsListResult,
};
use crate::state::{ConnectionState, StateManager};
use crate::transport::{Transport, TransportFactory};

/// A tool discovered on an upstream, addressable as `"<server>:<tool>"`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredTool {
    pub server_name: String,
    /// The server's own name for the tool
    pub name: String,
    /// The externally visible routing name
    pub public_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Collaborators shared by every client in a fleet
#[derive(Clone)]
pub struct ClientDeps {
    pub factory: Arc<dyn TransportFactory>,
    pub token_store: Arc<dyn TokenStore>,
    pub failure_log: Arc<dyn FailureLog>,
    pub events: Arc<dyn EventBus>,
    pub timeouts: Timeouts,
    pub backoff: BackoffConfig,
    /// Directory handed to the failure log for categorized entries
    pub failure_log_dir: PathBuf,
}

/// MCP client for one upstream server
pub struct UpstreamClient {
    config: ServerConfig,
    state: Arc<StateManager>,
    deps: ClientDeps,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    tools: StdRwLock<Arc<Vec<DiscoveredTool>>>,
    reconnect_lock: Mutex<()>,
    reconnect_in_progress: AtomicBool,
    containerized: AtomicBool,
    auto_disable_cb: StdRwLock<Option<ServerAutoDisableCallback>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl UpstreamClient {
    pub fn new(config: ServerConfig, deps: ClientDeps) -> Arc<Self> {
        let state = Arc::new(StateManager::new(
            config.name.clone(),
            deps.backoff.clone(),
            deps.events.clone(),
        ));
        if let Some(threshold) = config.auto_disable_threshold {
            state.set_auto_disable_threshold(threshold);
        }

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state,
            deps,
            transport: RwLock::new(None),
            tools: StdRwLock::new(Arc::new(Vec::new())),
            reconnect_lock: Mutex::new(()),
            reconnect_in_progress: AtomicBool::new(false),
            containerized: AtomicBool::new(false),
            auto_disable_cb: StdRwLock::new(None),
            supervisor: StdMutex::new(None),
            shutdown_tx,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn connection_info(&self) -> crate::state::ConnectionInfo {
        self.state.connection_info()
    }

    /// Tools cached from the last discovery; never re-fetched inline
    pub fn list_tools(&self) -> Arc<Vec<DiscoveredTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the auto-disable callback (fired at most once per disable)
    pub fn set_auto_disable_callback(&self, callback: ServerAutoDisableCallback) {
        *self
            .auto_disable_cb
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    // === Connect ===

    /// Dial the upstream: transport, initialize (with OAuth as needed),
    /// tool discovery, then `Ready`. Starts the supervisor on success.
    pub async fn connect(self: &Arc<Self>) -> UpstreamResult<()> {
        self.state.transition_to(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.start_supervisor();
                Ok(())
            }
            Err(e) => {
                self.record_connect_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> UpstreamResult<()> {
        let connect_deadline = self
            .deps
            .timeouts
            .connect_for(self.config.protocol.is_http_based());

        let bearer = self.stored_bearer_token().await;
        let transport = self.create_transport(bearer, connect_deadline).await?;

        let init = match self.initialize(&transport, connect_deadline).await {
            Ok(init) => init,
            Err(e) if e.is_auth_error() && self.can_run_oauth() => {
                let _ = transport.close().await;
                return self.establish_with_oauth(connect_deadline).await;
            }
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        self.finish_handshake(transport, init).await
    }

    /// Authorization path: run the interactive flow, then redo the
    /// handshake with the fresh token.
    async fn establish_with_oauth(
        self: &Arc<Self>,
        connect_deadline: Duration,
    ) -> UpstreamResult<()> {
        self.state.transition_to(ConnectionState::Authenticating);

        let oauth = self.oauth_flow()?;
        let token = oauth.authorize(self.deps.timeouts.oauth_flow).await?;

        if let Err(e) = self
            .deps
            .token_store
            .put(&self.config.name, token.clone())
            .await
        {
            tracing::warn!(server = %self.config.name, "failed to persist token: {}", e);
        }

        self.state.transition_to(ConnectionState::Connecting);
        let transport = self
            .create_transport(Some(token.access_token), connect_deadline)
            .await?;

        match self.initialize(&transport, connect_deadline).await {
            Ok(init) => self.finish_handshake(transport, init).await,
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    async fn finish_handshake(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        init: InitializeResult,
    ) -> UpstreamResult<()> {
        // Best effort: some servers never read the initialized notification
        let _ = transport
            .send_notification(JsonRpcRequest::notification(methods::INITIALIZED, None))
            .await;

        self.state.transition_to(ConnectionState::Discovering);
        let tools = match tokio::time::timeout(
            self.deps.timeouts.tools_list,
            self.discover_tools(&transport),
        )
        .await
        {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                let _ = transport.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = transport.close().await;
                return Err(UpstreamError::Timeout {
                    timeout: self.deps.timeouts.tools_list,
                });
            }
        };

        tracing::info!(
            server = %self.config.name,
            upstream = %init.server_info.name,
            version = %init.server_info.version,
            tools = tools.len(),
            "upstream ready"
        );

        *self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(tools);
        *self.transport.write().await = Some(transport);

        self.state
            .record_server_info(init.server_info.name, init.server_info.version);
        self.state.transition_to(ConnectionState::Ready);
        Ok(())
    }

    async fn create_transport(
        &self,
        bearer: Option<String>,
        deadline: Duration,
    ) -> UpstreamResult<Arc<dyn Transport>> {
        let created = tokio::time::timeout(deadline, self.deps.factory.create(&self.config, bearer))
            .await
            .map_err(|_| UpstreamError::Timeout { timeout: deadline })??;

        self.containerized
            .store(created.is_containerized(), Ordering::SeqCst);
        Ok(Arc::from(created))
    }

    async fn initialize(
        &self,
        transport: &Arc<dyn Transport>,
        deadline: Duration,
    ) -> UpstreamResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::for_proxy())?;
        let request = JsonRpcRequest::new(methods::INITIALIZE, Some(params));

        let response = tokio::time::timeout(deadline, transport.send_request(request))
            .await
            .map_err(|_| UpstreamError::Timeout { timeout: deadline })??;

        if let Some(error) = response.error {
            return Err(server_error(error));
        }

        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| UpstreamError::protocol("initialize returned no result"))?,
        )?;

        if !crate::protocol::is_supported_protocol_version(&result.protocol_version) {
            tracing::warn!(
                server = %self.config.name,
                version = %result.protocol_version,
                "server selected an unrecognized protocol version; continuing"
            );
        }

        Ok(result)
    }

    async fn discover_tools(
        &self,
        transport: &Arc<dyn Transport>,
    ) -> UpstreamResult<Vec<DiscoveredTool>> {
        let mut tools: Vec<DiscoveredTool> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = serde_json::to_value(ToolsListParams {
                cursor: cursor.clone(),
            })?;
            let request = JsonRpcRequest::new(methods::TOOLS_LIST, Some(params));
            let response = transport.send_request(request).await?;

            if let Some(error) = response.error {
                return Err(server_error(error));
            }

            let page: ToolsListResult = serde_json::from_value(
                response
                    .result
                    .ok_or_else(|| UpstreamError::protocol("tools/list returned no result"))?,
            )?;

            for tool in page.tools {
                let public_name = format!("{}:{}", self.config.name, tool.name);
                if tools.iter().any(|t| t.public_name == public_name) {
                    tracing::warn!(tool = %public_name, "skipping duplicated tool");
                    continue;
                }
                tools.push(DiscoveredTool {
                    server_name: self.config.name.clone(),
                    name: tool.name,
                    public_name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    fn can_run_oauth(&self) -> bool {
        self.config.oauth.is_some() && self.config.protocol.is_http_based()
    }

    fn oauth_flow(&self) -> UpstreamResult<OAuthFlow> {
        let url = self.config.url.as_deref().ok_or_else(|| {
            UpstreamError::configuration("OAuth requires a server url")
        })?;
        let oauth_config = self.config.oauth.clone().ok_or_else(|| {
            UpstreamError::configuration("server has no OAuth settings")
        })?;
        OAuthFlow::new(
            self.config.name.clone(),
            url,
            oauth_config,
            self.deps.events.clone(),
        )
    }

    /// Fetch the stored access token, refreshing it first when possible
    async fn stored_bearer_token(&self) -> Option<String> {
        if !self.config.protocol.is_http_based() {
            return None;
        }

        let token = match self.deps.token_store.get(&self.config.name).await {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(server = %self.config.name, "token store read failed: {}", e);
                return None;
            }
        };

        if !token.is_expired() {
            return Some(token.access_token);
        }

        if token.is_refreshable() && self.config.oauth.is_some() {
            if let Ok(flow) = self.oauth_flow() {
                match flow.refresh(&token).await {
                    Ok(fresh) => {
                        if let Err(e) = self
                            .deps
                            .token_store
                            .put(&self.config.name, fresh.clone())
                            .await
                        {
                            tracing::warn!(server = %self.config.name, "failed to persist refreshed token: {}", e);
                        }
                        return Some(fresh.access_token);
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.config.name, "token refresh failed: {}", e);
                    }
                }
            }
        }

        None
    }

    async fn record_connect_failure(self: &Arc<Self>, err: &UpstreamError) {
        if err.is_cancelled() {
            tracing::info!(server = %self.config.name, "connect canceled");
            self.state.transition_to(ConnectionState::Disconnected);
            return;
        }

        if err.is_rate_limit() {
            // Throttling is not a connection failure; no counters move
            self.state.transition_to(ConnectionState::Error);
            return;
        }

        if err.is_auth_error() {
            self.state.set_oauth_error(err);
        } else {
            self.state.set_error(err);
        }
        self.check_auto_disable(err).await;
    }

    // === Tool calls ===

    /// Execute a tool (by its original, unprefixed name) on this upstream
    pub async fn call_tool(
        self: &Arc<Self>,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> UpstreamResult<ToolsCallResult> {
        let server = self.config.name.as_str();

        // A reconnect owns the transport; fail fast rather than queue
        if self.reconnect_in_progress.load(Ordering::SeqCst) {
            return Err(UpstreamError::connection_failed("reconnect in progress")
                .enrich(server, Some(tool_name)));
        }

        let state = self.state.state();
        if state != ConnectionState::Ready {
            return Err(UpstreamError::connection_failed(format!(
                "not connected (state: {})",
                state
            ))
            .enrich(server, Some(tool_name)));
        }

        let transport = match self.transport.read().await.clone() {
            Some(transport) => transport,
            None => {
                return Err(UpstreamError::connection_failed("transport missing")
                    .enrich(server, Some(tool_name)))
            }
        };

        let params = serde_json::to_value(ToolsCallParams {
            name: tool_name.to_string(),
            arguments: Some(arguments),
        })?;
        let request = JsonRpcRequest::new(methods::TOOLS_CALL, Some(params));

        let response = match transport.send_request(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.handle_call_error(e, tool_name).await),
        };

        if let Some(error) = response.error {
            return Err(self.handle_call_error(server_error(error), tool_name).await);
        }

        let result: ToolsCallResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| UpstreamError::protocol("tools/call returned no result"))?,
        )?;
        Ok(result)
    }

    /// Classify a tool-call failure, update state, and kick off recovery
    async fn handle_call_error(
        self: &Arc<Self>,
        err: UpstreamError,
        tool_name: &str,
    ) -> UpstreamError {
        let server = self.config.name.as_str();

        if err.is_cancelled() || err.is_rate_limit() {
            // Neither counts as a connection failure
            return err.enrich(server, Some(tool_name));
        }

        if err.is_auth_error() {
            self.state.set_oauth_error(&err);
            self.check_auto_disable(&err).await;
            return err.enrich(server, Some(tool_name));
        }

        if err.is_connection_error() {
            self.state.set_error(&err);
            self.check_auto_disable(&err).await;

            // Recover in the background; the caller sees the failure now
            let client = self.clone();
            tokio::spawn(async move {
                let _ = client.reconnect().await;
            });
            return err.enrich(server, Some(tool_name));
        }

        // Non-connection errors pass through unchanged in meaning
        err.enrich(server, Some(tool_name))
    }

    // === Reconnect ===

    /// Tear down and re-dial. Exactly one attempt runs at a time; a caller
    /// that loses the race returns `Ok(false)` immediately.
    pub async fn reconnect(self: &Arc<Self>) -> UpstreamResult<bool> {
        if self.reconnect_in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!(server = %self.config.name, "reconnect already in progress");
            return Ok(false);
        }
        let _flag = ResetOnDrop(&self.reconnect_in_progress);
        let _serial = self.reconnect_lock.lock().await;

        tracing::info!(server = %self.config.name, "reconnecting");

        self.close_transport().await;
        // Transient fields go; failure history survives the reconnect
        self.state.reset();
        self.connect().await.map(|_| true)
    }

    // === Disconnect / shutdown ===

    /// Close the transport and mark the upstream disconnected. Idempotent.
    pub async fn disconnect(&self) {
        self.close_transport().await;
        self.state.transition_to(ConnectionState::Disconnected);
    }

    /// Disconnect and stop the supervisor loop
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.disconnect().await;
    }

    async fn close_transport(&self) {
        if let Some(transport) = self.transport.write().await.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(server = %self.config.name, "error closing transport: {}", e);
            }
        }
    }

    // === Auto-disable ===

    /// Apply the auto-disable policy after failures recorded outside the
    /// client's own paths (e.g. exhausted startup retries)
    pub async fn enforce_auto_disable(self: &Arc<Self>, err: &UpstreamError) {
        self.check_auto_disable(err).await;
    }

    /// After a counted failure: disable the server once the threshold is
    /// crossed, log it, tear down, and notify the embedder.
    async fn check_auto_disable(self: &Arc<Self>, err: &UpstreamError) {
        if !self.state.should_auto_disable() {
            return;
        }

        let info = self.state.connection_info();
        let reason = format!(
            "{} consecutive failures; last error: {}",
            info.consecutive_failures,
            info.last_error.as_deref().unwrap_or("unknown")
        );

        tracing::error!(server = %self.config.name, "auto-disabling: {}", reason);
        self.state.set_auto_disabled(reason.clone());

        self.deps
            .failure_log
            .log_detailed(
                &self.deps.failure_log_dir,
                &self.config.name,
                &reason,
                err.kind().as_str(),
                info.consecutive_failures,
                info.first_attempt_time,
            )
            .await;

        self.close_transport().await;
        self.state.transition_to(ConnectionState::Disconnected);

        let callback = self
            .auto_disable_cb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            let name = self.config.name.clone();
            // Fired outside every lock, on its own task
            tokio::spawn(async move {
                callback(&name, &reason);
            });
        }
    }

    // === Supervisor ===

    /// Whether this server was launched through a container runtime
    pub fn is_containerized(&self) -> bool {
        self.containerized.load(Ordering::SeqCst)
    }

    fn start_supervisor(self: &Arc<Self>) {
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.deps.backoff.health_loop_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let Some(client) = weak.upgrade() else { break };
                client.supervise_tick().await;
            }
        }));
    }

    async fn supervise_tick(self: &Arc<Self>) {
        if self.state.is_auto_disabled() || self.state.is_user_stopped() {
            return;
        }

        if self.state.is_oauth_error() {
            if self.state.should_retry_oauth() {
                let _ = self.reconnect().await;
            }
            return;
        }

        if self.state.state() == ConnectionState::Error {
            if self.state.should_retry() {
                let _ = self.reconnect().await;
            }
            return;
        }

        if !self.state.is_connected() {
            return;
        }

        // Container runtimes run their own health checks; probing through
        // the proxied stdio pipe would fight them.
        if self.is_containerized() {
            return;
        }

        if !self.config.health_check {
            return;
        }

        self.probe().await;
    }

    /// Short `tools/list` probe; a connection-class failure marks the
    /// upstream as errored so the next tick reconnects.
    async fn probe(self: &Arc<Self>) {
        let Some(transport) = self.transport.read().await.clone() else {
            return;
        };

        let params = match serde_json::to_value(ToolsListParams::default()) {
            Ok(params) => params,
            Err(_) => return,
        };
        let request = JsonRpcRequest::new(methods::TOOLS_LIST, Some(params));

        match tokio::time::timeout(
            self.deps.timeouts.health_probe,
            transport.send_request(request),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.is_connection_error() => {
                tracing::warn!(server = %self.config.name, "health probe failed: {}", e);
                self.state.set_error(&e);
                self.check_auto_disable(&e).await;
            }
            Ok(Err(e)) => {
                tracing::debug!(server = %self.config.name, "health probe error (ignored): {}", e);
            }
            Err(_) => {
                let err = UpstreamError::Timeout {
                    timeout: self.deps.timeouts.health_probe,
                };
                tracing::warn!(server = %self.config.name, "health probe timed out");
                self.state.set_error(&err);
                self.check_auto_disable(&err).await;
            }
        }
    }
}

/// Clears the reconnect-in-progress flag even on early return or panic
struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Map a JSON-RPC error object onto the error taxonomy
fn server_error(error: JsonRpcError) -> UpstreamError {
    let lower = error.message.to_ascii_lowercase();
    if lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("authorization required")
        || lower.contains("invalid token")
    {
        UpstreamError::authorization_required(error.message)
    } else if lower.contains("429") || lower.contains("rate limit") {
        UpstreamError::RateLimited {
            message: error.message,
            retry_after: None,
        }
    } else {
        UpstreamError::Server {
            code: error.code,
            message: error.message,
        }
    }
}

//! Transport layer for upstream MCP servers
//!
//! Four transports: child-process stdio, plain HTTP, SSE, and streamable
//! HTTP. A transport is created already connected; the client owns its
//! lifetime and tears it down on disconnect, fatal error, or before a
//! reconnect.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_config::{Protocol, ServerConfig, Timeouts};
use mcpproxy_interfaces::{CommandSpec, IsolationAdapter, RunnerKind};

use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Request/response channel to one upstream server.
///
/// Implementations own request/response correlation; `send_request` returns
/// the response matching the request's id, however the wire interleaves it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, notification: JsonRpcRequest) -> UpstreamResult<()>;

    /// Liveness signal: false once the transport has observed a fatal error
    async fn is_alive(&self) -> bool;

    /// Transport health snapshot
    async fn health(&self) -> TransportHealth;

    /// Close the transport. Idempotent; terminates any owned child process.
    async fn close(&self) -> UpstreamResult<()>;

    /// Transport kind label for logs
    fn kind(&self) -> &'static str;

    /// Whether the server runs inside an external container runtime
    fn is_containerized(&self) -> bool {
        false
    }
}

/// Transport health information
#[derive(Debug, Clone, PartialEq)]
pub struct TransportHealth {
    /// Whether the transport is usable
    pub connected: bool,

    /// Last successful message timestamp
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,

    /// Last error encountered
    pub last_error: Option<String>,

    /// Number of consecutive failed operations
    pub consecutive_failures: u32,

    /// Round-trip latency of the last successful operation
    pub latency: Option<Duration>,
}

impl TransportHealth {
    /// A healthy, just-connected transport
    pub fn healthy() -> Self {
        Self {
            connected: true,
            last_success: Some(chrono::Utc::now()),
            last_error: None,
            consecutive_failures: 0,
            latency: None,
        }
    }

    /// A transport that has not connected (or has failed)
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            last_success: None,
            last_error: Some(error.into()),
            consecutive_failures: 1,
            latency: None,
        }
    }

    /// Mark a successful operation
    pub fn mark_success(&mut self, latency: Option<Duration>) {
        self.connected = true;
        self.last_success = Some(chrono::Utc::now());
        self.last_error = None;
        self.consecutive_failures = 0;
        self.latency = latency;
    }

    /// Mark a failed operation
    pub fn mark_failure(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.last_error = Some(error.into());
        self.consecutive_failures += 1;
    }
}

/// Builds transports from server configuration
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a connected transport for the given server.
    ///
    /// `bearer_token` carries a stored OAuth access token for HTTP-family
    /// transports; stdio transports ignore it.
    async fn create(
        &self,
        config: &ServerConfig,
        bearer_token: Option<String>,
    ) -> UpstreamResult<Box<dyn Transport>>;
}

/// Production factory: spawns child processes, opens HTTP clients, and
/// (when enabled) wraps recognized interpreter runners in containers.
pub struct DefaultTransportFactory {
    timeouts: Timeouts,
    state_dir: Option<PathBuf>,
    isolation: Option<Arc<dyn IsolationAdapter>>,
    docker_isolation: bool,
}

impl DefaultTransportFactory {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            timeouts,
            state_dir: None,
            isolation: None,
            docker_isolation: false,
        }
    }

    /// Directory for PID files tracking spawned children
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Enable container isolation for recognized runners
    pub fn with_isolation(mut self, adapter: Arc<dyn IsolationAdapter>) -> Self {
        self.isolation = Some(adapter);
        self.docker_isolation = true;
        self
    }

    fn pid_file_for(&self, server_name: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.pid", server_name)))
    }

    /// Terminate orphaned children recorded in stale PID files.
    ///
    /// Called once before the first spawn so a previous crash of the proxy
    /// does not leak processes.
    pub async fn reconcile_stale_processes(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        stdio::reconcile_pid_files(dir).await;
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        config: &ServerConfig,
        bearer_token: Option<String>,
    ) -> UpstreamResult<Box<dyn Transport>> {
        match config.protocol {
            Protocol::Stdio => {
                let mut spec = CommandSpec {
                    command: config.command.clone(),
                    args: config.args.clone(),
                    env: config.env.clone(),
                    working_dir: config.working_dir.clone(),
                };

                let mut containerized = false;
                if self.docker_isolation
                    && RunnerKind::detect(&spec.command).is_known_runner()
                {
                    if let Some(isolation) = &self.isolation {
                        let wrapped = isolation
                            .wrap(&config.name, spec.clone())
                            .await
                            .map_err(|e| UpstreamError::configuration(e.to_string()))?;
                        spec = wrapped.spec;
                        containerized = true;
                    }
                }

                let transport = StdioTransport::spawn(
                    &config.name,
                    spec,
                    self.pid_file_for(&config.name),
                    self.timeouts.shutdown_grace,
                    containerized,
                )
                .await?;
                Ok(Box::new(transport))
            }
            Protocol::Http => {
                let url = require_url(config)?;
                Ok(Box::new(HttpTransport::new(
                    url,
                    config.headers.clone(),
                    bearer_token,
                    self.timeouts.connect_http,
                )?))
            }
            Protocol::Sse => {
                let url = require_url(config)?;
                let transport = SseTransport::connect(
                    url,
                    config.headers.clone(),
                    bearer_token,
                    self.timeouts.connect_http,
                )
                .await?;
                Ok(Box::new(transport))
            }
            Protocol::StreamableHttp => {
                let url = require_url(config)?;
                Ok(Box::new(StreamableHttpTransport::new(
                    url,
                    config.headers.clone(),
                    bearer_token,
                    self.timeouts.connect_http,
                )?))
            }
        }
    }
}

fn require_url(config: &ServerConfig) -> UpstreamResult<&str> {
    config.url.as_deref().ok_or_else(|| {
        UpstreamError::configuration(format!(
            "server '{}' uses {} but has no url",
            config.name, config.protocol
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_health() {
        let mut health = TransportHealth::healthy();
        assert!(health.connected);
        assert_eq!(health.consecutive_failures, 0);

        health.mark_failure("connection reset");
        assert!(!health.connected);
        assert_eq!(health.consecutive_failures, 1);

        health.mark_success(Some(Duration::from_millis(12)));
        assert!(health.connected);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.latency, Some(Duration::from_millis(12)));
    }

    #[tokio::test]
    async fn test_factory_requires_url_for_http() {
        let factory = DefaultTransportFactory::new(Timeouts::default());
        let config = ServerConfig {
            url: None,
            ..ServerConfig::remote("gh", Protocol::Http, "https://example.com")
        };
        let result = factory.create(&config, None).await;
        assert!(matches!(result, Err(UpstreamError::Configuration { .. })));
    }
}

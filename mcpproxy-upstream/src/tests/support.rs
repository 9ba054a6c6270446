//! Mock transports and shared fixtures

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_config::{BackoffConfig, ServerConfig, Timeouts};
use mcpproxy_interfaces::{MemoryTokenStore, NullEventBus, TracingFailureLog};

use crate::client::ClientDeps;
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Transport, TransportFactory, TransportHealth};

/// Scripted behavior shared between a mock factory and its transports
#[derive(Default)]
pub struct MockBehavior {
    /// Fail this many `initialize` calls with a connection error
    pub connect_failures: AtomicU32,
    /// Fail every `initialize` call
    pub fail_forever: AtomicBool,
    /// Delay inside `initialize`, to widen race windows
    pub initialize_delay_ms: AtomicU32,
    /// `initialize` calls observed
    pub initializes: AtomicU32,
    /// Transports constructed by the factory
    pub transports_created: AtomicU32,
    /// Transports closed
    pub transports_closed: AtomicU32,
    /// Canned per-tool responses for `tools/call`
    pub call_results: std::sync::Mutex<HashMap<String, CallScript>>,
}

/// What `tools/call` should do for one tool
#[derive(Clone)]
pub enum CallScript {
    /// Return a text content result
    Text(String),
    /// Return a JSON-RPC error with this message
    RpcError(String),
    /// Fail at the transport level with a connection error
    ConnectionError,
}

impl MockBehavior {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_connects(count: u32) -> Arc<Self> {
        let behavior = Self::new();
        behavior.connect_failures.store(count, Ordering::SeqCst);
        behavior
    }

    pub fn always_failing() -> Arc<Self> {
        let behavior = Self::new();
        behavior.fail_forever.store(true, Ordering::SeqCst);
        behavior
    }

    pub fn script_tool(&self, tool: &str, script: CallScript) {
        self.call_results
            .lock()
            .unwrap()
            .insert(tool.to_string(), script);
    }
}

/// Mock transport answering the MCP client subset from a script
pub struct MockTransport {
    behavior: Arc<MockBehavior>,
    server_name: String,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse> {
        match request.method.as_str() {
            "initialize" => {
                self.behavior.initializes.fetch_add(1, Ordering::SeqCst);

                let delay = self.behavior.initialize_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }

                if self.behavior.fail_forever.load(Ordering::SeqCst) {
                    return Err(UpstreamError::connection_failed("connection refused"));
                }

                let remaining = self.behavior.connect_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.behavior
                        .connect_failures
                        .store(remaining - 1, Ordering::SeqCst);
                    return Err(UpstreamError::connection_failed("connection refused"));
                }

                Ok(JsonRpcResponse::success(
                    json!({
                        "protocolVersion": "2025-03-26",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": self.server_name, "version": "1.0.0" }
                    }),
                    request.id,
                ))
            }
            "tools/list" => Ok(JsonRpcResponse::success(
                json!({
                    "tools": [
                        {
                            "name": "add",
                            "description": "Add two integers",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "a": { "type": "integer" },
                                    "b": { "type": "integer" }
                                }
                            }
                        }
                    ]
                }),
                request.id,
            )),
            "tools/call" => {
                let tool = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                let script = self.behavior.call_results.lock().unwrap().get(&tool).cloned();
                match script {
                    Some(CallScript::Text(text)) => Ok(JsonRpcResponse::success(
                        json!({ "content": [{ "type": "text", "text": text }] }),
                        request.id,
                    )),
                    Some(CallScript::RpcError(message)) => Ok(JsonRpcResponse::error(
                        JsonRpcError::new(-32000, message, None),
                        request.id,
                    )),
                    Some(CallScript::ConnectionError) => {
                        Err(UpstreamError::connection_failed("broken pipe"))
                    }
                    None => {
                        // The default "add" tool computes a + b
                        if tool == "add" {
                            let args = request
                                .params
                                .as_ref()
                                .and_then(|p| p.get("arguments"))
                                .cloned()
                                .unwrap_or(Value::Null);
                            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                            Ok(JsonRpcResponse::success(
                                json!({
                                    "content": [{ "type": "text", "text": (a + b).to_string() }]
                                }),
                                request.id,
                            ))
                        } else {
                            Ok(JsonRpcResponse::error(
                                JsonRpcError::new(-32601, format!("no such tool: {}", tool), None),
                                request.id,
                            ))
                        }
                    }
                }
            }
            other => Ok(JsonRpcResponse::error(
                JsonRpcError::new(-32601, format!("method not found: {}", other), None),
                request.id,
            )),
        }
    }

    async fn send_notification(&self, _notification: JsonRpcRequest) -> UpstreamResult<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn health(&self) -> TransportHealth {
        TransportHealth::healthy()
    }

    async fn close(&self) -> UpstreamResult<()> {
        self.behavior
            .transports_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

/// Factory handing out [`MockTransport`]s bound to one behavior script
pub struct MockFactory {
    behavior: Arc<MockBehavior>,
}

impl MockFactory {
    pub fn new(behavior: Arc<MockBehavior>) -> Arc<Self> {
        Arc::new(Self { behavior })
    }
}

#[async_trait::async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        config: &ServerConfig,
        _bearer_token: Option<String>,
    ) -> UpstreamResult<Box<dyn Transport>> {
        self.behavior
            .transports_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            behavior: self.behavior.clone(),
            server_name: config.name.clone(),
        }))
    }
}

/// Client dependencies wired to mocks, with fast policy knobs
pub fn mock_deps(behavior: Arc<MockBehavior>, backoff: BackoffConfig) -> ClientDeps {
    ClientDeps {
        factory: MockFactory::new(behavior),
        token_store: Arc::new(MemoryTokenStore::new()),
        failure_log: Arc::new(TracingFailureLog),
        events: Arc::new(NullEventBus),
        timeouts: Timeouts::default(),
        backoff,
        failure_log_dir: PathBuf::from("logs"),
    }
}

/// Backoff tuned so tests never sit in real sleeps
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(1),
        startup_grace: Duration::ZERO,
        ..BackoffConfig::default()
    }
}

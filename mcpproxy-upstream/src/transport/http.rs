//! Plain HTTP request/response transport
//!
//! One JSON-RPC POST per request. Authorization failures surface as
//! OAuth-class errors so the client can start (or refresh) a token flow.

use reqwest::header;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{Transport, TransportHealth};
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// HTTP transport for request/response MCP servers
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    bearer: Option<String>,
    health: Mutex<TransportHealth>,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        bearer: Option<String>,
        timeout: Duration,
    ) -> UpstreamResult<Self> {
        url::Url::parse(url)
            .map_err(|e| UpstreamError::configuration(format!("invalid url '{}': {}", url, e)))?;

        let client = build_client(&headers, timeout)?;

        Ok(Self {
            url: url.to_string(),
            client,
            bearer,
            health: Mutex::new(TransportHealth::healthy()),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> UpstreamResult<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);

        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        check_http_status(response).await
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse> {
        let started = Instant::now();

        let result: UpstreamResult<JsonRpcResponse> = async {
            let response = self.post(&request).await?;
            Ok(response.json::<JsonRpcResponse>().await?)
        }
        .await;

        match &result {
            Ok(_) => {
                self.health.lock().await.mark_success(Some(started.elapsed()));
            }
            Err(e) => {
                self.health.lock().await.mark_failure(e.to_string());
            }
        }
        result
    }

    async fn send_notification(&self, notification: JsonRpcRequest) -> UpstreamResult<()> {
        self.post(&notification).await.map(|_| ())
    }

    async fn is_alive(&self) -> bool {
        self.health.lock().await.connected
    }

    async fn health(&self) -> TransportHealth {
        self.health.lock().await.clone()
    }

    async fn close(&self) -> UpstreamResult<()> {
        self.health.lock().await.connected = false;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Build a reqwest client with the configured default headers.
///
/// No overall timeout: streaming transports hold responses open, and the
/// caller wraps each operation in its own deadline anyway.
pub(super) fn build_client(
    headers: &HashMap<String, String>,
    connect_timeout: Duration,
) -> UpstreamResult<reqwest::Client> {
    let mut header_map = header::HeaderMap::new();
    for (key, value) in headers {
        let name = header::HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            UpstreamError::configuration(format!("invalid header name '{}': {}", key, e))
        })?;
        let value = header::HeaderValue::from_str(value).map_err(|e| {
            UpstreamError::configuration(format!("invalid header value for '{}': {}", key, e))
        })?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| UpstreamError::transport(format!("failed to build HTTP client: {}", e)))
}

/// Map HTTP status codes onto the error taxonomy
pub(super) async fn check_http_status(
    response: reqwest::Response,
) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let hint = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(|v| format!(" ({})", v))
            .unwrap_or_default();
        return Err(UpstreamError::authorization_required(format!(
            "server returned {}{}",
            status, hint
        )));
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(UpstreamError::RateLimited {
            message: format!("server returned {}", status),
            retry_after,
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::transport(format!(
        "server returned {}: {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}

//! Streamable HTTP transport
//!
//! Every request is a POST accepting either a direct JSON response or a
//! one-shot SSE body carrying the response as a `message` event. The
//! server-assigned session id travels in the `Mcp-Session-Id` header.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::http::{build_client, check_http_status};
use super::sse::SseDecoder;
use super::{Transport, TransportHealth};
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Session id header used by streamable HTTP servers
const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP transport
pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    bearer: Option<String>,
    session_id: RwLock<Option<String>>,
    health: Mutex<TransportHealth>,
}

impl StreamableHttpTransport {
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        bearer: Option<String>,
        timeout: Duration,
    ) -> UpstreamResult<Self> {
        url::Url::parse(url)
            .map_err(|e| UpstreamError::configuration(format!("invalid url '{}': {}", url, e)))?;

        Ok(Self {
            url: url.to_string(),
            client: build_client(&headers, timeout)?,
            bearer,
            session_id: RwLock::new(None),
            health: Mutex::new(TransportHealth::healthy()),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> UpstreamResult<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);

        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(session) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_ID_HEADER, session);
        }

        let response = request.send().await?;
        let response = check_http_status(response).await?;

        // Servers assign (or rotate) the session id on any response
        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.write().await;
            if slot.as_deref() != Some(session) {
                *slot = Some(session.to_string());
            }
        }

        Ok(response)
    }

    /// Extract the JSON-RPC response matching `expected_id` from either a
    /// JSON body or a one-shot SSE body
    async fn read_response(
        response: reqwest::Response,
        expected_id: &str,
    ) -> UpstreamResult<JsonRpcResponse> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if !content_type.starts_with("text/event-stream") {
            return Ok(response.json::<JsonRpcResponse>().await?);
        }

        let mut decoder = SseDecoder::new(Box::pin(response.bytes_stream()));
        while let Some(event) = decoder.next_event().await? {
            if event.event != "message" {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("unparseable event in response stream: {}", e);
                    continue;
                }
            };

            if value.get("method").is_some() {
                tracing::trace!("skipping server-initiated message in response stream");
                continue;
            }

            let parsed: JsonRpcResponse = serde_json::from_value(value)?;
            match parsed.id_key() {
                Some(ref id) if id.as_str() == expected_id => return Ok(parsed),
                _ => continue,
            }
        }

        Err(UpstreamError::protocol(
            "response stream ended without a matching response",
        ))
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse> {
        let expected_id = request.id_key().ok_or_else(|| {
            UpstreamError::protocol("send_request requires a request id")
        })?;

        let started = Instant::now();
        let result: UpstreamResult<JsonRpcResponse> = async {
            let response = self.post(&request).await?;
            Self::read_response(response, &expected_id).await
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
        self.session_id.write().await.take();
        self.health.lock().await.connected = false;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "streamable-http"
    }
}

//! SSE transport: GET an event stream, POST requests, correlate responses
//!
//! The server's first `endpoint` event names the POST URL. A reader task
//! owns the event stream and completes pending requests by id; when the
//! stream ends, every pending request fails as a disconnect.

use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::http::{build_client, check_http_status};
use super::{Transport, TransportHealth};
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// A decoded server-sent event
#[derive(Debug, Clone, PartialEq)]
pub(super) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE frame decoder over a byte stream
pub(super) struct SseDecoder<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S, B> SseDecoder<S>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Next complete event, or `None` when the stream ends
    pub async fn next_event(&mut self) -> UpstreamResult<Option<SseEvent>> {
        loop {
            if let Some(frame) = self.take_frame() {
                if let Some(event) = parse_frame(&frame) {
                    return Ok(Some(event));
                }
                // Comment-only or empty frame; keep reading
                continue;
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    /// Remove and return the first complete frame from the buffer
    fn take_frame(&mut self) -> Option<String> {
        let boundary = find_frame_boundary(&self.buf)?;
        let rest = self.buf.split_off(boundary.end);
        let frame = String::from_utf8_lossy(&self.buf[..boundary.start]).into_owned();
        self.buf = rest;
        Some(frame)
    }
}

struct FrameBoundary {
    start: usize,
    end: usize,
}

fn find_frame_boundary(buf: &[u8]) -> Option<FrameBoundary> {
    // Frames end at a blank line: \n\n or \r\n\r\n
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some(FrameBoundary {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some(FrameBoundary {
                start: i,
                end: i + 4,
            });
        }
    }
    None
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines = Vec::new();

    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim_start().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id: and retry: fields are irrelevant to this client; comments start with ':'
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// SSE transport for servers speaking the GET-stream + POST-messages flavor
pub struct SseTransport {
    post_url: String,
    client: reqwest::Client,
    bearer: Option<String>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    health: Mutex<TransportHealth>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server's `endpoint` event
    pub async fn connect(
        url: &str,
        headers: HashMap<String, String>,
        bearer: Option<String>,
        timeout: Duration,
    ) -> UpstreamResult<Self> {
        let base = url::Url::parse(url)
            .map_err(|e| UpstreamError::configuration(format!("invalid url '{}': {}", url, e)))?;

        let client = build_client(&headers, timeout)?;

        let mut request = client.get(url).header("Accept", "text/event-stream");
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let response = check_http_status(response).await?;

        let mut decoder = SseDecoder::new(Box::pin(response.bytes_stream()));

        // The endpoint event must arrive before any request can be posted
        let endpoint = tokio::time::timeout(timeout, async {
            loop {
                match decoder.next_event().await? {
                    Some(event) if event.event == "endpoint" => return Ok(event.data),
                    Some(_) => continue,
                    None => {
                        return Err(UpstreamError::connection_failed(
                            "event stream closed before endpoint event",
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| UpstreamError::Timeout { timeout })??;

        let post_url = base
            .join(endpoint.trim())
            .map_err(|e| UpstreamError::protocol(format!("invalid endpoint '{}': {}", endpoint, e)))?
            .to_string();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(reader_loop(
            decoder,
            pending.clone(),
            connected.clone(),
        ));

        Ok(Self {
            post_url,
            client,
            bearer,
            pending,
            connected,
            health: Mutex::new(TransportHealth::healthy()),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> UpstreamResult<()> {
        let mut request = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        check_http_status(response).await?;
        Ok(())
    }
}

async fn reader_loop<S, B>(mut decoder: SseDecoder<S>, pending: PendingMap, connected: Arc<AtomicBool>)
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        match decoder.next_event().await {
            Ok(Some(event)) if event.event == "message" => {
                let value: serde_json::Value = match serde_json::from_str(&event.data) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("unparseable SSE message: {}", e);
                        continue;
                    }
                };

                if value.get("method").is_some() {
                    tracing::trace!("skipping server-initiated SSE message");
                    continue;
                }

                let response: JsonRpcResponse = match serde_json::from_value(value) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!("malformed SSE response: {}", e);
                        continue;
                    }
                };

                if let Some(id) = response.id_key() {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(response);
                    } else {
                        tracing::warn!(id = %id, "response for unknown request id");
                    }
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                tracing::info!("event stream ended");
                break;
            }
            Err(e) => {
                tracing::warn!("event stream error: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders fails every in-flight request as a disconnect
    pending.lock().await.clear();
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(UpstreamError::connection_failed("event stream closed"));
        }

        let id = request.id_key().ok_or_else(|| {
            UpstreamError::protocol("send_request requires a request id")
        })?;

        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.post(&request).await {
            self.pending.lock().await.remove(&id);
            self.health.lock().await.mark_failure(e.to_string());
            return Err(e);
        }

        match rx.await {
            Ok(response) => {
                self.health.lock().await.mark_success(Some(started.elapsed()));
                Ok(response)
            }
            Err(_) => {
                let err = UpstreamError::connection_failed("event stream closed while waiting");
                self.health.lock().await.mark_failure(err.to_string());
                Err(err)
            }
        }
    }

    async fn send_notification(&self, notification: JsonRpcRequest) -> UpstreamResult<()> {
        self.post(&notification).await
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health(&self) -> TransportHealth {
        self.health.lock().await.clone()
    }

    async fn close(&self) -> UpstreamResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
        self.health.lock().await.connected = false;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}

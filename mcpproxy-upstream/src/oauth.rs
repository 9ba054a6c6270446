//! OAuth 2.1 authorization with PKCE for HTTP-family upstreams
//!
//! The flow: discover endpoints on the server origin, bind a single-use
//! loopback listener for the redirect, send the user's browser to the
//! authorization URL (or publish it as an event in headless environments),
//! then exchange the returned code for a token. A process-wide port
//! registry keeps concurrent flows off each other's callback ports.

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::Engine;
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

use mcpproxy_config::OAuthConfig;
use mcpproxy_interfaces::{EventBus, OAuthToken, ProxyEvent};

use crate::error::{UpstreamError, UpstreamResult};

/// PKCE verifier/challenge pair (S256)
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh 64-character verifier and its S256 challenge
    pub fn generate() -> Self {
        let verifier: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        Self::from_verifier(verifier)
    }

    fn from_verifier(verifier: String) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Authorization server metadata (RFC 8414 subset)
#[derive(Debug, Clone, Deserialize)]
struct AuthServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

type CallbackSlot = Arc<StdMutex<Option<oneshot::Sender<CallbackParams>>>>;

/// One OAuth authorization flow for one upstream server
pub struct OAuthFlow {
    server_name: String,
    server_url: Url,
    config: OAuthConfig,
    http: reqwest::Client,
    events: Arc<dyn EventBus>,
}

impl OAuthFlow {
    pub fn new(
        server_name: impl Into<String>,
        server_url: &str,
        config: OAuthConfig,
        events: Arc<dyn EventBus>,
    ) -> UpstreamResult<Self> {
        let server_url = Url::parse(server_url).map_err(|e| {
            UpstreamError::configuration(format!("invalid server url '{}': {}", server_url, e))
        })?;

        Ok(Self {
            server_name: server_name.into(),
            server_url,
            config,
            http: reqwest::Client::new(),
            events,
        })
    }

    /// Run the interactive authorization flow and return the token.
    ///
    /// `flow_timeout` bounds the wait for the user to complete the browser
    /// round trip.
    pub async fn authorize(&self, flow_timeout: Duration) -> UpstreamResult<OAuthToken> {
        let metadata = self.discover().await?;

        let (listener, claim) = bind_callback_listener(self.config.callback_port_range).await?;
        let redirect_uri = format!("http://127.0.0.1:{}/callback", claim.port);

        let client_id = self.resolve_client_id(&metadata, &redirect_uri).await?;
        let pkce = PkcePair::generate();
        let state_param: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let authorization_url = build_authorization_url(
            &metadata.authorization_endpoint,
            &client_id,
            &redirect_uri,
            &self.config.scopes,
            &state_param,
            &pkce.challenge,
        )?;

        let (tx, rx) = oneshot::channel();
        let slot: CallbackSlot = Arc::new(StdMutex::new(Some(tx)));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route("/callback", get(callback_handler))
            .with_state(slot);

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::warn!("callback listener error: {}", e);
            }
        });

        if is_headless() {
            tracing::info!(
                server = %self.server_name,
                url = %authorization_url,
                "headless environment; authorization must be completed manually"
            );
            self.events.publish(ProxyEvent::OAuthAuthorizationPending {
                server: self.server_name.clone(),
                authorization_url: authorization_url.clone(),
            });
        } else if let Err(e) = open_browser(&authorization_url).await {
            tracing::warn!(server = %self.server_name, "failed to open browser: {}", e);
            self.events.publish(ProxyEvent::OAuthAuthorizationPending {
                server: self.server_name.clone(),
                authorization_url: authorization_url.clone(),
            });
        }

        let callback = tokio::time::timeout(flow_timeout, rx).await;
        let _ = shutdown_tx.send(());
        let _ = server.await;
        drop(claim);

        let params = match callback {
            Ok(Ok(params)) => params,
            Ok(Err(_)) => {
                return Err(UpstreamError::authorization_required(
                    "callback listener closed before the redirect arrived",
                ))
            }
            Err(_) => {
                return Err(UpstreamError::authorization_required(format!(
                    "authorization not completed within {:?}",
                    flow_timeout
                )))
            }
        };

        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            return Err(UpstreamError::authorization_required(format!(
                "authorization server returned '{}': {}",
                error, description
            )));
        }

        if params.state.as_deref() != Some(state_param.as_str()) {
            return Err(UpstreamError::authorization_required(
                "state parameter mismatch on callback",
            ));
        }

        let code = params.code.ok_or_else(|| {
            UpstreamError::authorization_required("callback carried no authorization code")
        })?;

        self.exchange_code(&metadata.token_endpoint, &client_id, &code, &redirect_uri, &pkce)
            .await
    }

    /// Exchange a refresh token for a fresh access token
    pub async fn refresh(&self, token: &OAuthToken) -> UpstreamResult<OAuthToken> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            UpstreamError::authorization_required("stored token has no refresh token")
        })?;

        let metadata = self.discover().await?;
        let client_id = self.config.client_id.clone().unwrap_or_default();

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if !client_id.is_empty() {
            form.push(("client_id", client_id));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| UpstreamError::authorization_required(format!("token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(UpstreamError::authorization_required(format!(
                "token refresh failed: server returned {}",
                response.status()
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::authorization_required(format!("bad token response: {}", e)))?;

        tracing::info!(server = %self.server_name, "refreshed OAuth token");
        Ok(into_oauth_token(token_response, token.refresh_token.clone()))
    }

    /// Resolve authorization/token endpoints: explicit config first, then
    /// RFC 8414 discovery on the server origin, then conventional paths.
    async fn discover(&self) -> UpstreamResult<AuthServerMetadata> {
        if let (Some(authorization), Some(token)) = (
            self.config.authorization_endpoint.clone(),
            self.config.token_endpoint.clone(),
        ) {
            return Ok(AuthServerMetadata {
                authorization_endpoint: authorization,
                token_endpoint: token,
                registration_endpoint: None,
            });
        }

        let origin = origin_of(&self.server_url)?;
        let well_known = format!("{}/.well-known/oauth-authorization-server", origin);

        match self.http.get(&well_known).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<AuthServerMetadata>().await {
                    Ok(metadata) => return Ok(metadata),
                    Err(e) => {
                        tracing::warn!(
                            server = %self.server_name,
                            "malformed authorization server metadata: {}",
                            e
                        );
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(
                    server = %self.server_name,
                    status = %response.status(),
                    "no authorization server metadata published"
                );
            }
            Err(e) => {
                tracing::debug!(server = %self.server_name, "metadata fetch failed: {}", e);
            }
        }

        Ok(AuthServerMetadata {
            authorization_endpoint: format!("{}/authorize", origin),
            token_endpoint: format!("{}/token", origin),
            registration_endpoint: None,
        })
    }

    /// Use the configured client id, or register one dynamically (RFC 7591)
    async fn resolve_client_id(
        &self,
        metadata: &AuthServerMetadata,
        redirect_uri: &str,
    ) -> UpstreamResult<String> {
        if let Some(client_id) = &self.config.client_id {
            return Ok(client_id.clone());
        }

        let registration_endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            UpstreamError::authorization_required(
                "no client_id configured and the server does not support dynamic registration",
            )
        })?;

        let body = serde_json::json!({
            "client_name": "mcpproxy",
            "redirect_uris": [redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });

        let response = self
            .http
            .post(registration_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                UpstreamError::authorization_required(format!("client registration failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(UpstreamError::authorization_required(format!(
                "client registration failed: server returned {}",
                response.status()
            )));
        }

        let registration: RegistrationResponse = response.json().await.map_err(|e| {
            UpstreamError::authorization_required(format!("bad registration response: {}", e))
        })?;

        tracing::info!(server = %self.server_name, "registered OAuth client dynamically");
        Ok(registration.client_id)
    }

    async fn exchange_code(
        &self,
        token_endpoint: &str,
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        pkce: &PkcePair,
    ) -> UpstreamResult<OAuthToken> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("code_verifier", &pkce.verifier),
        ];

        let response = self
            .http
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| UpstreamError::authorization_required(format!("token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::authorization_required(format!(
                "token exchange failed: server returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::authorization_required(format!("bad token response: {}", e)))?;

        tracing::info!(server = %self.server_name, "obtained OAuth token");
        Ok(into_oauth_token(token_response, None))
    }
}

fn into_oauth_token(response: TokenResponse, fallback_refresh: Option<String>) -> OAuthToken {
    OAuthToken {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(fallback_refresh),
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_at: response
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
        scopes: response
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
    }
}

fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    challenge: &str,
) -> UpstreamResult<String> {
    let mut url = Url::parse(authorization_endpoint).map_err(|e| {
        UpstreamError::configuration(format!(
            "invalid authorization endpoint '{}': {}",
            authorization_endpoint, e
        ))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
    }

    Ok(url.to_string())
}

fn origin_of(url: &Url) -> UpstreamResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| UpstreamError::configuration(format!("url '{}' has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

async fn callback_handler(
    State(slot): State<CallbackSlot>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let sender = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(tx) = sender {
        let _ = tx.send(params);
    }
    Html("<html><body><p>Authorization complete. You may close this window.</p></body></html>")
}

// === Loopback port allocation ===

/// Ports currently claimed by in-flight flows in this process
fn claimed_ports() -> &'static StdMutex<HashSet<u16>> {
    static CLAIMED: OnceLock<StdMutex<HashSet<u16>>> = OnceLock::new();
    CLAIMED.get_or_init(|| StdMutex::new(HashSet::new()))
}

/// RAII claim on a callback port
struct PortClaim {
    port: u16,
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        claimed_ports()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

async fn bind_callback_listener(
    range: Option<(u16, u16)>,
) -> UpstreamResult<(TcpListener, PortClaim)> {
    match range {
        None => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            claimed_ports()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(port);
            Ok((listener, PortClaim { port }))
        }
        Some((low, high)) => {
            for port in low..=high {
                {
                    let mut claimed = claimed_ports()
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    if !claimed.insert(port) {
                        continue;
                    }
                }
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => return Ok((listener, PortClaim { port })),
                    Err(_) => {
                        claimed_ports()
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&port);
                    }
                }
            }
            Err(UpstreamError::configuration(format!(
                "no free callback port in {}..={}",
                low, high
            )))
        }
    }
}

// === Browser launch ===

/// Whether to skip the browser and surface the URL via an event instead
fn is_headless() -> bool {
    if std::env::var_os("MCPPROXY_NO_BROWSER").is_some() {
        return true;
    }
    if cfg!(any(target_os = "macos", windows)) {
        false
    } else {
        std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none()
    }
}

async fn open_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        let mut c = tokio::process::Command::new("open");
        c.arg(url);
        c
    } else if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.args(["/C", "start", "", url]);
        c
    } else {
        let mut c = tokio::process::Command::new("xdg-open");
        c.arg(url);
        c
    };

    command.stdout(std::process::Stdio::null());
    command.stderr(std::process::Stdio::null());
    command.spawn().map(|_| ())
}

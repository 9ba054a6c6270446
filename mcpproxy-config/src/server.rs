//! Upstream server configuration

use crate::error::ConfigResult;
use crate::limits::{BackoffConfig, Timeouts};
use crate::validation::{self, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transport protocol for an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Local child process speaking line-delimited JSON-RPC
    #[default]
    Stdio,
    /// Plain HTTP request/response
    Http,
    /// HTTP with a server-sent-events response channel
    Sse,
    /// Streamable HTTP (POST with JSON or SSE responses)
    StreamableHttp,
}

impl Protocol {
    /// Protocol name as written in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Stdio => "stdio",
            Protocol::Http => "http",
            Protocol::Sse => "sse",
            Protocol::StreamableHttp => "streamable-http",
        }
    }

    /// Whether this protocol connects over HTTP
    pub fn is_http_based(&self) -> bool {
        !matches!(self, Protocol::Stdio)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth settings for an upstream that requires authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthConfig {
    /// Scopes requested during authorization
    pub scopes: Vec<String>,

    /// Loopback port range for the redirect listener; any free port when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_port_range: Option<(u16, u16)>,

    /// Pre-registered client id; dynamic registration is attempted when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Explicit authorization endpoint, overriding discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// Explicit token endpoint, overriding discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

/// Configuration for one upstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique server name; doubles as the tool-name routing prefix
    pub name: String,

    /// Transport protocol
    pub protocol: Protocol,

    /// Command to execute (stdio)
    pub command: String,

    /// Command arguments (stdio)
    pub args: Vec<String>,

    /// Environment variables for the child process (stdio)
    pub env: HashMap<String, String>,

    /// Working directory for the child process (stdio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Endpoint URL (http / sse / streamable-http)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra HTTP headers sent with every request
    pub headers: HashMap<String, String>,

    /// Whether the server participates at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Present in config but barred from executing tools pending review
    pub quarantined: bool,

    /// Dial during startup; false defers the first connect to first use
    #[serde(default = "default_true")]
    pub start_on_boot: bool,

    /// Opt in to active liveness probes from the supervisor loop
    pub health_check: bool,

    /// Consecutive failures before auto-disable; 0 disables the feature,
    /// unset falls back to the global default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_disable_threshold: Option<u32>,

    /// Mirrored by the core when it auto-disables the server
    pub auto_disabled: bool,

    /// Human-readable reason recorded at auto-disable time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_disable_reason: Option<String>,

    /// OAuth settings for servers that require authorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Stdio,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            enabled: true,
            quarantined: false,
            start_on_boot: true,
            health_check: false,
            auto_disable_threshold: None,
            auto_disabled: false,
            auto_disable_reason: None,
            oauth: None,
        }
    }
}

impl ServerConfig {
    /// Minimal stdio server config
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Stdio,
            command: command.into(),
            args,
            ..Default::default()
        }
    }

    /// Minimal HTTP-family server config
    pub fn remote(name: impl Into<String>, protocol: Protocol, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol,
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

impl Validatable for ServerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_required_string(&self.name, "name", self.domain_name())?;

        // The name prefixes public tool names as "<name>:<tool>"
        if self.name.contains(':') {
            return Err(self.validation_error(format!(
                "name '{}' must not contain ':' (reserved as the tool-name delimiter)",
                self.name
            )));
        }

        match self.protocol {
            Protocol::Stdio => {
                validation::validate_required_string(&self.command, "command", self.domain_name())?;
            }
            Protocol::Http | Protocol::Sse | Protocol::StreamableHttp => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| self.validation_error("url is required for HTTP protocols"))?;
                validation::validate_url(url, "url", self.domain_name())?;
            }
        }

        if let Some(oauth) = &self.oauth {
            if let Some(range) = oauth.callback_port_range {
                validation::validate_port_range(range, "callback_port_range", self.domain_name())?;
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "server"
    }
}

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream servers, keyed externally by their unique names
    pub servers: Vec<ServerConfig>,

    /// Operation deadlines
    pub timeouts: Timeouts,

    /// Retry, backoff, and auto-disable policy
    pub backoff: BackoffConfig,

    /// Wrap recognized interpreter runners in containers
    pub docker_isolation: bool,
}

impl Validatable for ProxyConfig {
    fn validate(&self) -> ConfigResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(self.validation_error(format!("duplicate server name '{}'", server.name)));
            }
        }
        self.timeouts.validate()?;
        self.backoff.validate()?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "proxy"
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

//! Error types and the failure classifier for upstream operations

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Errors raised while talking to an upstream server
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Transport-level errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Connection establishment or loss
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Operation exceeded its deadline
    #[error("Timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Protocol-level errors (malformed or unexpected messages)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The server demands authorization the client cannot satisfy
    #[error("Authorization required: {reason}")]
    AuthorizationRequired { reason: String },

    /// The server is throttling us
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// No such tool on the routed server
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    /// The tool ran and failed
    #[error("Tool call failed: {tool_name}: {reason}")]
    ToolCallFailed { tool_name: String, reason: String },

    /// The spawn command does not exist on this machine
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },

    /// Configuration errors surfaced at connect time
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {details}")]
    Serialization { details: String },

    /// JSON-RPC error response from the server
    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    /// Operation cancelled by the caller; never counted as a failure
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },
}

impl UpstreamError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an authorization-required error
    pub fn authorization_required(reason: impl Into<String>) -> Self {
        Self::AuthorizationRequired {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cancellation marker
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Classify this error for retry and auto-disable policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::ConnectionFailed { reason } => classify_message(reason, ErrorKind::Connection),
            UpstreamError::Timeout { .. } => ErrorKind::Connection,
            UpstreamError::AuthorizationRequired { .. } => ErrorKind::Oauth,
            UpstreamError::RateLimited { .. } => ErrorKind::RateLimit,
            UpstreamError::CommandNotFound { command } => {
                if mcpproxy_interfaces::RunnerKind::detect(command).is_known_runner() {
                    ErrorKind::MissingPackage
                } else {
                    ErrorKind::Config
                }
            }
            UpstreamError::Configuration { .. } => ErrorKind::Config,
            UpstreamError::Transport { message } => classify_message(message, ErrorKind::Network),
            UpstreamError::Server { message, code } => {
                if *code == 429 {
                    ErrorKind::RateLimit
                } else {
                    classify_message(message, ErrorKind::Unknown)
                }
            }
            UpstreamError::ToolCallFailed { reason, .. } => classify_message(reason, ErrorKind::Unknown),
            UpstreamError::Protocol { .. }
            | UpstreamError::Serialization { .. }
            | UpstreamError::ToolNotFound { .. }
            | UpstreamError::Cancelled { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether this error indicates a broken connection
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Whether this error calls for (re-)authorization
    pub fn is_auth_error(&self) -> bool {
        self.kind() == ErrorKind::Oauth
    }

    /// Whether this error is throttling, not failure
    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }

    /// Whether this error represents caller-driven cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpstreamError::Cancelled { .. })
    }

    /// Wrap the error with routing context and an actionable hint
    pub fn enrich(self, server: &str, tool: Option<&str>) -> Self {
        let target = match tool {
            Some(tool) => format!("server '{}', tool '{}'", server, tool),
            None => format!("server '{}'", server),
        };

        match self {
            UpstreamError::RateLimited {
                message,
                retry_after,
            } => UpstreamError::RateLimited {
                message: format!("{}: rate limit hit ({}); please wait before retrying", target, message),
                retry_after,
            },
            UpstreamError::AuthorizationRequired { reason } => UpstreamError::AuthorizationRequired {
                reason: format!(
                    "{}: authentication failed ({}); run the OAuth login for this server",
                    target, reason
                ),
            },
            UpstreamError::CommandNotFound { command } => UpstreamError::Configuration {
                message: format!(
                    "{}: command '{}' not found; check that it is installed and on PATH",
                    target, command
                ),
            },
            UpstreamError::ConnectionFailed { reason } => UpstreamError::ConnectionFailed {
                reason: format!("{}: {}", target, reason),
            },
            UpstreamError::Timeout { timeout } => UpstreamError::ConnectionFailed {
                reason: format!("{}: timed out after {:?}", target, timeout),
            },
            UpstreamError::Transport { message } => UpstreamError::Transport {
                message: format!("{}: {}", target, message),
            },
            UpstreamError::Server { code, message } => UpstreamError::Server {
                code,
                message: format!("{}: {}", target, message),
            },
            other => other,
        }
    }
}

/// Failure categories used by retry policy, auto-disable, and the failure log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Refused, host unknown, reset, broken pipe, timeout, stream disconnect
    Connection,
    /// Invalid/expired token, unauthorized, 401
    Oauth,
    /// 429 or an explicit rate-limit message
    RateLimit,
    /// Spawn failure for a recognized interpreter runner
    MissingPackage,
    /// Invalid command, bad URL, unreadable working directory
    Config,
    /// EACCES/EPERM on a file or socket
    Permission,
    /// General transport failure not covered above
    Network,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Stable label used in failure logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Oauth => "oauth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::MissingPackage => "missing_package",
            ErrorKind::Config => "config",
            ErrorKind::Permission => "permission",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error message by keyword, falling back to `fallback`
fn classify_message(message: &str, fallback: ErrorKind) -> ErrorKind {
    let lower = message.to_ascii_lowercase();

    if lower.contains("permission denied") || lower.contains("eacces") || lower.contains("eperm") {
        return ErrorKind::Permission;
    }
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        return ErrorKind::RateLimit;
    }
    if lower.contains("401")
        || lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("token expired")
        || lower.contains("expired token")
        || lower.contains("authorization required")
    {
        return ErrorKind::Oauth;
    }
    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("reset by peer")
        || lower.contains("broken pipe")
        || lower.contains("no such host")
        || lower.contains("name resolution")
        || lower.contains("dns error")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("deadline")
        || lower.contains("stream closed")
        || lower.contains("closed stdout")
        || lower.contains("process has terminated")
        || lower.contains("unexpected eof")
        || lower.contains("not connected")
    {
        return ErrorKind::Connection;
    }
    if lower.contains("invalid url") || lower.contains("working directory") {
        return ErrorKind::Config;
    }

    fallback
}

// Implement conversions from common error types
impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            UpstreamError::ConnectionFailed {
                reason: err.to_string(),
            }
        } else {
            UpstreamError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => UpstreamError::Timeout {
                timeout: Duration::from_secs(30),
            },
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => UpstreamError::ConnectionFailed {
                reason: err.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => UpstreamError::Transport {
                message: format!("permission denied: {}", err),
            },
            _ => UpstreamError::Transport {
                message: err.to_string(),
            },
        }
    }
}

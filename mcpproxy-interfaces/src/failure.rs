//! Failure log interface
//!
//! Persistent-failure and auto-disable decisions write a categorized entry
//! through this interface so operators can reconstruct why a server was
//! taken out of rotation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Sink for categorized failure records
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Record a failure with its classification and history.
    ///
    /// `error_kind` is the classifier label (e.g. `connection`, `oauth`);
    /// `first_attempt_time` anchors the record to the connection attempt
    /// series it belongs to.
    async fn log_detailed(
        &self,
        dir: &Path,
        server_name: &str,
        message: &str,
        error_kind: &str,
        consecutive_failures: u32,
        first_attempt_time: Option<DateTime<Utc>>,
    );
}

/// Failure log that emits structured tracing events instead of files
#[derive(Default)]
pub struct TracingFailureLog;

#[async_trait]
impl FailureLog for TracingFailureLog {
    async fn log_detailed(
        &self,
        _dir: &Path,
        server_name: &str,
        message: &str,
        error_kind: &str,
        consecutive_failures: u32,
        first_attempt_time: Option<DateTime<Utc>>,
    ) {
        tracing::error!(
            server = %server_name,
            kind = %error_kind,
            consecutive_failures,
            first_attempt = ?first_attempt_time,
            "upstream failure: {}",
            message
        );
    }
}

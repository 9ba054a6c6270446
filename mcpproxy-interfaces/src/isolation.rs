//! Container isolation interface for stdio servers
//!
//! When the embedder enables Docker isolation, recognized interpreter
//! runners are rewritten to execute inside a container. The core only sees
//! the rewritten command; container lifecycle details stay behind this
//! trait.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by isolation adapters
#[derive(Error, Debug)]
pub enum IsolationError {
    /// The container runtime is unavailable
    #[error("Container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    /// The command cannot be containerized
    #[error("Command cannot be isolated: {reason}")]
    Unsupported { reason: String },
}

/// A command line with its environment, as configured for a stdio server
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

/// The result of wrapping a command for container execution
#[derive(Debug, Clone)]
pub struct IsolatedCommand {
    /// The rewritten command line to spawn instead of the original
    pub spec: CommandSpec,

    /// Container identifier, when the runtime assigns one up front
    pub container_id: Option<String>,
}

/// Adapter that rewrites stdio commands to run inside a container
#[async_trait]
pub trait IsolationAdapter: Send + Sync {
    /// Wrap a command for isolated execution
    async fn wrap(
        &self,
        server_name: &str,
        spec: CommandSpec,
    ) -> Result<IsolatedCommand, IsolationError>;

    /// Tear down any container state left behind for a server
    async fn teardown(&self, server_name: &str);
}

/// Classification of stdio commands by interpreter ecosystem.
///
/// Only recognized runners are candidates for container isolation, and a
/// spawn failure for a recognized runner points at a missing package
/// installation rather than a generic transport problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Python,
    Node,
    Other,
}

impl RunnerKind {
    /// Detect the runner kind from the command's base name
    pub fn detect(command: &str) -> Self {
        let base = command
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(command)
            .to_ascii_lowercase();
        let base = base.strip_suffix(".exe").unwrap_or(&base);

        match base {
            "python" | "python3" | "uv" | "uvx" | "pip" | "pipx" => RunnerKind::Python,
            "node" | "npx" | "npm" | "bun" | "bunx" | "deno" => RunnerKind::Node,
            _ => RunnerKind::Other,
        }
    }

    /// Whether this command belongs to a known interpreter ecosystem
    pub fn is_known_runner(self) -> bool {
        !matches!(self, RunnerKind::Other)
    }
}

//! # MCPProxy Upstream Core
//!
//! The upstream connection core of MCPProxy: one aggregating endpoint in
//! front of many heterogeneous MCP servers. Each upstream gets a client
//! that negotiates its transport, performs the MCP `initialize` handshake
//! (completing OAuth 2.1 + PKCE when the server demands it), discovers
//! tools, supervises the connection, and auto-disables the server after
//! persistent failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   AI client (host)   │
//! └──────────┬───────────┘
//!            │  CallTool("server:tool")
//! ┌──────────▼───────────┐
//! │   UpstreamManager    │  startup orchestration, monitors, routing
//! │  ┌────────────────┐  │
//! │  │ UpstreamClient │  │  per-server: handshake, supervision,
//! │  │  StateManager  │  │  retry/backoff, auto-disable
//! │  └───────┬────────┘  │
//! └──────────┼───────────┘
//!            │
//!     ┌──────┴───────┐
//!     │  Transport   │  stdio / http / sse / streamable-http
//!     └──────┬───────┘
//!            │
//!   upstream MCP server
//! ```
//!
//! Persistence, eventing, and container isolation stay behind the traits
//! in `mcpproxy-interfaces`; configuration comes from `mcpproxy-config`.

pub mod client;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod protocol;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientDeps, DiscoveredTool, UpstreamClient};
pub use error::{ErrorKind, UpstreamError, UpstreamResult};
pub use manager::UpstreamManager;
pub use oauth::{OAuthFlow, PkcePair};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallResult};
pub use state::{
    ConnectionInfo, ConnectionState, ServerState, StateManager, OAUTH_BACKOFF_SCHEDULE,
};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory, TransportHealth};

#[cfg(test)]
mod tests;

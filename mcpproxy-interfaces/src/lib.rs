//! # MCPProxy Interfaces
//!
//! Traits implemented by external collaborators of the upstream connection
//! core. The core crate (`mcpproxy-upstream`) consumes these interfaces
//! without depending on any concrete persistence, eventing, or container
//! runtime, which keeps the embedder free to supply its own.
//!
//! ## Main Interfaces
//!
//! - [`TokenStore`] - OAuth token persistence, keyed by server name
//! - [`FailureLog`] - categorized failure records for diagnostics
//! - [`EventBus`] - fan-out of state-change and auto-disable events
//! - [`IsolationAdapter`] - optional container wrapping for stdio servers
//! - [`OAuthEventQueue`] - completion records from external auth flows

pub mod events;
pub mod failure;
pub mod isolation;
pub mod oauth_queue;
pub mod token;

// Re-export commonly used types
pub use events::{BroadcastEventBus, EventBus, NullEventBus, ProxyEvent, ServerAutoDisableCallback};
pub use failure::{FailureLog, TracingFailureLog};
pub use isolation::{CommandSpec, IsolatedCommand, IsolationAdapter, IsolationError, RunnerKind};
pub use oauth_queue::{MemoryOAuthEventQueue, OAuthCompletion, OAuthEventQueue};
pub use token::{FileTokenStore, MemoryTokenStore, OAuthToken, TokenStore, TokenStoreError};

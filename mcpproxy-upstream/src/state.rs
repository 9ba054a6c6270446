//! Per-upstream state tracking and retry policy
//!
//! One [`StateManager`] per upstream server is the single source of truth
//! for two independent state machines: the runtime connection state and the
//! persisted server state. It also owns every retry/backoff decision, the
//! startup grace period, and the auto-disable threshold logic.
//!
//! Invalid transitions are logged and applied anyway; a state machine that
//! refuses to move would hide real connection behavior from operators.

use chrono::{DateTime, Utc};
use mcpproxy_config::BackoffConfig;
use mcpproxy_interfaces::{EventBus, ProxyEvent};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::UpstreamError;

/// OAuth retry schedule indexed by the number of OAuth failures so far.
/// Interactive flows are expensive; the schedule climbs fast and tops out
/// at one attempt per day.
pub const OAUTH_BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(4 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// Retry counts above this no longer grow the exponential backoff
const MAX_BACKOFF_SHIFT: u32 = 30;

/// Runtime connection state of one upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Discovering,
    Ready,
    Error,
}

impl ConnectionState {
    /// Whether moving to `next` is a documented transition.
    ///
    /// Any state may move to `Disconnected` (teardown), and `Connecting`
    /// may jump straight to `Ready` for OAuth flows that complete inside
    /// the initialize handshake.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Disconnected || self == next {
            return true;
        }

        match self {
            Disconnected => matches!(next, Connecting),
            Connecting => matches!(next, Authenticating | Discovering | Ready | Error),
            Authenticating => matches!(next, Connecting | Discovering | Ready | Error),
            Discovering => matches!(next, Ready | Error),
            Ready => matches!(next, Error),
            Error => matches!(next, Connecting),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted configuration state of one upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Active,
    Disabled,
    Quarantined,
    AutoDisabled,
    LazyLoading,
}

impl ServerState {
    /// Whether moving to `next` is a permitted persisted-state transition
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;

        if self == next {
            return false;
        }

        match (self, next) {
            (Active, _) => true,
            (Disabled, AutoDisabled) => false,
            (Disabled, _) => true,
            (Quarantined, Active) | (Quarantined, Disabled) => true,
            (Quarantined, _) => false,
            (AutoDisabled, Active) | (AutoDisabled, Disabled) => true,
            (AutoDisabled, _) => false,
            (LazyLoading, _) => true,
        }
    }

    /// Stable states never transition automatically; `quarantined` and
    /// `auto_disabled` are cleared by manual or group action.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            ServerState::Active | ServerState::Disabled | ServerState::LazyLoading
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Active => "active",
            ServerState::Disabled => "disabled",
            ServerState::Quarantined => "quarantined",
            ServerState::AutoDisabled => "auto_disabled",
            ServerState::LazyLoading => "lazy_loading",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an upstream's connection state, returned by queries and
/// attached to state-change events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub server_state: ServerState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub last_oauth_attempt: Option<DateTime<Utc>>,
    pub oauth_retry_count: u32,
    pub is_oauth_error: bool,
    pub first_attempt_time: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub auto_disabled: bool,
    pub auto_disable_reason: Option<String>,
    pub auto_disable_threshold: u32,
    pub last_success_time: Option<DateTime<Utc>>,
}

/// Callback invoked (on its own task) after every connection-state change
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

#[derive(Debug)]
struct StateInner {
    state: ConnectionState,
    server_state: ServerState,
    last_error: Option<String>,
    retry_count: u32,
    last_retry_time: Option<DateTime<Utc>>,
    server_name: Option<String>,
    server_version: Option<String>,
    last_oauth_attempt: Option<DateTime<Utc>>,
    oauth_retry_count: u32,
    is_oauth_error: bool,
    first_attempt_time: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    auto_disabled: bool,
    auto_disable_reason: Option<String>,
    auto_disable_threshold: u32,
    last_success_time: Option<DateTime<Utc>>,
    user_stopped: bool,
}

/// State tracking and retry policy for one upstream server
pub struct StateManager {
    name: String,
    backoff: BackoffConfig,
    inner: RwLock<StateInner>,
    callback: RwLock<Option<StateChangeCallback>>,
    events: Arc<dyn EventBus>,
}

impl StateManager {
    pub fn new(name: impl Into<String>, backoff: BackoffConfig, events: Arc<dyn EventBus>) -> Self {
        let threshold = backoff.auto_disable_threshold;
        Self {
            name: name.into(),
            backoff,
            inner: RwLock::new(StateInner {
                state: ConnectionState::Disconnected,
                server_state: ServerState::Active,
                last_error: None,
                retry_count: 0,
                last_retry_time: None,
                server_name: None,
                server_version: None,
                last_oauth_attempt: None,
                oauth_retry_count: 0,
                is_oauth_error: false,
                first_attempt_time: None,
                connected_at: None,
                consecutive_failures: 0,
                auto_disabled: false,
                auto_disable_reason: None,
                auto_disable_threshold: threshold,
                last_success_time: None,
                user_stopped: false,
            }),
            callback: RwLock::new(None),
            events,
        }
    }

    /// The server this manager tracks
    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// Install the state-change callback. Installed once, before the client
    /// starts connecting.
    pub fn set_state_change_callback(&self, callback: StateChangeCallback) {
        *write_poison_safe(&self.callback) = Some(callback);
    }

    fn read(&self) -> RwLockReadGuard<'_, StateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // === Queries ===

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.read().state
    }

    /// Current persisted server state
    pub fn server_state(&self) -> ServerState {
        self.read().server_state
    }

    /// Consistent snapshot of everything
    pub fn connection_info(&self) -> ConnectionInfo {
        snapshot(&self.read())
    }

    pub fn is_connected(&self) -> bool {
        self.read().state == ConnectionState::Ready
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.read().state,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Discovering
        )
    }

    pub fn is_oauth_error(&self) -> bool {
        self.read().is_oauth_error
    }

    pub fn is_auto_disabled(&self) -> bool {
        self.read().auto_disabled
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.read().consecutive_failures
    }

    // === Connection state transitions ===

    /// Move to a new connection state, applying the documented side effects.
    ///
    /// An undocumented transition is logged at `warn` and applied anyway.
    pub fn transition_to(&self, next: ConnectionState) {
        let (old, info) = {
            let mut inner = self.write();
            let old = inner.state;

            if !old.can_transition_to(next) {
                tracing::warn!(
                    server = %self.name,
                    from = %old,
                    to = %next,
                    "undocumented connection state transition"
                );
            }

            inner.state = next;
            match next {
                ConnectionState::Connecting => {
                    if inner.first_attempt_time.is_none() {
                        inner.first_attempt_time = Some(Utc::now());
                    }
                }
                ConnectionState::Ready => {
                    let now = Utc::now();
                    inner.connected_at = Some(now);
                    inner.last_success_time = Some(now);
                    inner.last_error = None;
                    inner.retry_count = 0;
                    inner.consecutive_failures = 0;
                    inner.is_oauth_error = false;
                    inner.oauth_retry_count = 0;
                }
                _ => {}
            }

            (old, snapshot(&inner))
        };

        if old != next {
            tracing::debug!(server = %self.name, from = %old, to = %next, "connection state changed");
            self.dispatch_change(old, next, info);
        }
    }

    /// Record a failure: move to `Error`, bump the retry and failure
    /// counters. Cancellation is logged but never counted.
    pub fn set_error(&self, err: &UpstreamError) {
        if err.is_cancelled() {
            tracing::debug!(server = %self.name, "context canceled; not counted as failure");
            return;
        }

        let (old, info) = {
            let mut inner = self.write();
            let old = inner.state;
            inner.state = ConnectionState::Error;
            inner.last_error = Some(err.to_string());
            inner.retry_count = inner.retry_count.saturating_add(1);
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_retry_time = Some(Utc::now());
            (old, snapshot(&inner))
        };

        tracing::warn!(
            server = %self.name,
            consecutive_failures = info.consecutive_failures,
            "upstream error: {}",
            err
        );

        if old != ConnectionState::Error {
            self.dispatch_change(old, ConnectionState::Error, info);
        }
    }

    /// Record an authorization failure; enters the OAuth backoff schedule
    pub fn set_oauth_error(&self, err: &UpstreamError) {
        if err.is_cancelled() {
            tracing::debug!(server = %self.name, "context canceled; not counted as failure");
            return;
        }

        let (old, info) = {
            let mut inner = self.write();
            let old = inner.state;
            inner.state = ConnectionState::Error;
            inner.last_error = Some(err.to_string());
            inner.retry_count = inner.retry_count.saturating_add(1);
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_retry_time = Some(Utc::now());
            inner.is_oauth_error = true;
            inner.oauth_retry_count = inner.oauth_retry_count.saturating_add(1);
            inner.last_oauth_attempt = Some(Utc::now());
            (old, snapshot(&inner))
        };

        tracing::warn!(
            server = %self.name,
            oauth_retry_count = info.oauth_retry_count,
            "upstream authorization error: {}",
            err
        );

        if old != ConnectionState::Error {
            self.dispatch_change(old, ConnectionState::Error, info);
        }
    }

    /// Record the identity the server reported during initialize
    pub fn record_server_info(&self, name: impl Into<String>, version: impl Into<String>) {
        let mut inner = self.write();
        inner.server_name = Some(name.into());
        inner.server_version = Some(version.into());
    }

    /// Return to `Disconnected` and clear transient connection fields.
    ///
    /// Failure history survives: `consecutive_failures`, `auto_disabled`,
    /// `last_success_time`, `first_attempt_time`, and the OAuth retry count
    /// are preserved so a disconnect cannot launder a failing server.
    pub fn reset(&self) {
        let (old, info) = {
            let mut inner = self.write();
            let old = inner.state;
            inner.state = ConnectionState::Disconnected;
            inner.last_error = None;
            inner.retry_count = 0;
            inner.last_retry_time = None;
            inner.is_oauth_error = false;
            inner.connected_at = None;
            inner.server_name = None;
            inner.server_version = None;
            (old, snapshot(&inner))
        };

        if old != ConnectionState::Disconnected {
            self.dispatch_change(old, ConnectionState::Disconnected, info);
        }
    }

    // === Retry policy ===

    /// Exponential backoff delay for a given retry count
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let shift = (retry_count - 1).min(MAX_BACKOFF_SHIFT);
        let factor = 1u64 << shift;
        let delay = Duration::from_nanos(
            (self.backoff.initial.as_nanos() as u64).saturating_mul(factor),
        );
        delay.min(self.backoff.max)
    }

    /// Whether a generic reconnect attempt is due. Only meaningful in the
    /// `Error` state.
    pub fn should_retry(&self) -> bool {
        let inner = self.read();
        if inner.state != ConnectionState::Error {
            return false;
        }

        let delay = self.backoff_delay(inner.retry_count);
        match inner.last_retry_time {
            Some(last) => elapsed_since(last) >= delay,
            None => true,
        }
    }

    /// OAuth backoff delay for a given OAuth failure count
    pub fn oauth_backoff_delay(oauth_retry_count: u32) -> Duration {
        let index = oauth_retry_count.saturating_sub(1).min(4) as usize;
        OAUTH_BACKOFF_SCHEDULE[index]
    }

    /// Whether an OAuth reconnect attempt is due
    pub fn should_retry_oauth(&self) -> bool {
        let inner = self.read();
        if !inner.is_oauth_error || inner.state != ConnectionState::Error {
            return false;
        }

        let delay = Self::oauth_backoff_delay(inner.oauth_retry_count);
        match inner.last_oauth_attempt {
            Some(last) => elapsed_since(last) >= delay,
            None => true,
        }
    }

    // === Auto-disable policy ===

    /// Whether the failure count warrants auto-disabling the server.
    ///
    /// During the startup grace period the bar doubles, so a slow
    /// subprocess bootstrap does not get a server disabled.
    pub fn should_auto_disable(&self) -> bool {
        let inner = self.read();
        if inner.auto_disabled || inner.auto_disable_threshold == 0 {
            return false;
        }

        let threshold = if in_grace_period(&inner, self.backoff.startup_grace) {
            inner.auto_disable_threshold.saturating_mul(2)
        } else {
            inner.auto_disable_threshold
        };

        inner.consecutive_failures >= threshold
    }

    /// Whether the startup grace window is still open
    pub fn is_in_grace_period(&self) -> bool {
        in_grace_period(&self.read(), self.backoff.startup_grace)
    }

    /// Time left in the startup grace window
    pub fn grace_period_remaining(&self) -> Duration {
        let inner = self.read();
        match inner.first_attempt_time {
            None => self.backoff.startup_grace,
            Some(first) => self
                .backoff
                .startup_grace
                .saturating_sub(elapsed_since(first)),
        }
    }

    /// Mark the server auto-disabled and move the persisted state.
    /// Only `reset_auto_disable` clears this.
    pub fn set_auto_disabled(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut inner = self.write();
            inner.auto_disabled = true;
            inner.auto_disable_reason = Some(reason.clone());
        }
        self.transition_server_state(ServerState::AutoDisabled);

        self.events.publish(ProxyEvent::ServerAutoDisabled {
            server: self.name.clone(),
            reason,
        });
    }

    /// Restore a persisted auto-disable flag at load time. No events: the
    /// disable already happened in a previous run.
    pub fn restore_auto_disabled(&self, reason: impl Into<String>) {
        let mut inner = self.write();
        inner.auto_disabled = true;
        inner.auto_disable_reason = Some(reason.into());
        inner.server_state = ServerState::AutoDisabled;
    }

    /// Clear the auto-disable flag and the failure count behind it
    pub fn reset_auto_disable(&self) {
        let mut inner = self.write();
        inner.auto_disabled = false;
        inner.auto_disable_reason = None;
        inner.consecutive_failures = 0;
    }

    pub fn reset_consecutive_failures(&self) {
        self.write().consecutive_failures = 0;
    }

    pub fn set_auto_disable_threshold(&self, threshold: u32) {
        self.write().auto_disable_threshold = threshold;
    }

    pub fn auto_disable_threshold(&self) -> u32 {
        self.read().auto_disable_threshold
    }

    // === Persisted server state ===

    /// Set the persisted state without transition checks (initial load)
    pub fn set_server_state(&self, state: ServerState) {
        self.write().server_state = state;
    }

    /// Move the persisted state, logging undocumented transitions.
    ///
    /// Leaving `auto_disabled` for a stable state also clears the failure
    /// history so re-enabled servers start with a clean slate.
    pub fn transition_server_state(&self, next: ServerState) {
        let (old, info) = {
            let mut inner = self.write();
            let old = inner.server_state;
            if old == next {
                return;
            }
            if !old.can_transition_to(next) {
                tracing::warn!(
                    server = %self.name,
                    from = %old,
                    to = %next,
                    "undocumented server state transition"
                );
            }
            inner.server_state = next;
            if old == ServerState::AutoDisabled && next == ServerState::Active {
                inner.auto_disabled = false;
                inner.auto_disable_reason = None;
                inner.consecutive_failures = 0;
            }
            (old, snapshot(&inner))
        };

        tracing::info!(server = %self.name, from = %old, to = %next, "server state changed");
        self.publish_state_change(old.as_str(), next.as_str(), info);
    }

    // === Runtime-only user intent ===

    pub fn is_user_stopped(&self) -> bool {
        self.read().user_stopped
    }

    pub fn set_user_stopped(&self, stopped: bool) {
        self.write().user_stopped = stopped;
    }

    // === Internals ===

    fn dispatch_change(&self, old: ConnectionState, new: ConnectionState, info: ConnectionInfo) {
        let callback = read_poison_safe(&self.callback).clone();
        if let Some(callback) = callback {
            // Callbacks run outside every lock, on their own task when a
            // runtime is available, so a callback that re-enters the state
            // manager cannot deadlock.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { callback(old, new) });
                }
                Err(_) => callback(old, new),
            }
        }

        self.publish_state_change(old.as_str(), new.as_str(), info);
    }

    fn publish_state_change(&self, old: &str, new: &str, info: ConnectionInfo) {
        let snapshot = serde_json::to_value(&info).unwrap_or(serde_json::Value::Null);
        self.events.publish(ProxyEvent::ServerStateChanged {
            server: self.name.clone(),
            old_state: old.to_string(),
            new_state: new.to_string(),
            snapshot,
        });
    }
}

fn snapshot(inner: &StateInner) -> ConnectionInfo {
    ConnectionInfo {
        state: inner.state,
        server_state: inner.server_state,
        last_error: inner.last_error.clone(),
        retry_count: inner.retry_count,
        last_retry_time: inner.last_retry_time,
        server_name: inner.server_name.clone(),
        server_version: inner.server_version.clone(),
        last_oauth_attempt: inner.last_oauth_attempt,
        oauth_retry_count: inner.oauth_retry_count,
        is_oauth_error: inner.is_oauth_error,
        first_attempt_time: inner.first_attempt_time,
        connected_at: inner.connected_at,
        consecutive_failures: inner.consecutive_failures,
        auto_disabled: inner.auto_disabled,
        auto_disable_reason: inner.auto_disable_reason.clone(),
        auto_disable_threshold: inner.auto_disable_threshold,
        last_success_time: inner.last_success_time,
    }
}

fn in_grace_period(inner: &StateInner, grace: Duration) -> bool {
    match inner.first_attempt_time {
        // No attempt yet means startup has not begun for this server
        None => true,
        Some(first) => elapsed_since(first) < grace,
    }
}

fn elapsed_since(then: DateTime<Utc>) -> Duration {
    (Utc::now() - then).to_std().unwrap_or(Duration::ZERO)
}

fn read_poison_safe<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_poison_safe<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_interfaces::NullEventBus;

    fn manager() -> StateManager {
        StateManager::new("test", BackoffConfig::default(), Arc::new(NullEventBus))
    }

    fn manager_with(backoff: BackoffConfig) -> StateManager {
        StateManager::new("test", backoff, Arc::new(NullEventBus))
    }

    fn connection_error() -> UpstreamError {
        UpstreamError::connection_failed("connection refused")
    }

    #[test]
    fn test_connection_transition_table() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Ready));

        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Connecting.can_transition_to(Ready)); // OAuth inside initialize
        assert!(Connecting.can_transition_to(Error));

        assert!(Authenticating.can_transition_to(Connecting));
        assert!(Discovering.can_transition_to(Ready));
        assert!(!Discovering.can_transition_to(Connecting));

        assert!(Ready.can_transition_to(Error));
        assert!(!Ready.can_transition_to(Connecting));

        assert!(Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Ready));

        // Teardown is always allowed
        for state in [Disconnected, Connecting, Authenticating, Discovering, Ready, Error] {
            assert!(state.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn test_server_state_transition_table() {
        use ServerState::*;

        for target in [Disabled, Quarantined, AutoDisabled, LazyLoading] {
            assert!(Active.can_transition_to(target));
        }

        assert!(Disabled.can_transition_to(Active));
        assert!(!Disabled.can_transition_to(AutoDisabled));

        assert!(Quarantined.can_transition_to(Active));
        assert!(!Quarantined.can_transition_to(AutoDisabled));
        assert!(!Quarantined.can_transition_to(LazyLoading));

        assert!(AutoDisabled.can_transition_to(Active));
        assert!(!AutoDisabled.can_transition_to(Quarantined));
        assert!(!AutoDisabled.can_transition_to(LazyLoading));

        for target in [Active, Disabled, Quarantined, AutoDisabled] {
            assert!(LazyLoading.can_transition_to(target));
        }

        assert!(Active.is_stable());
        assert!(LazyLoading.is_stable());
        assert!(!Quarantined.is_stable());
        assert!(!AutoDisabled.is_stable());
    }

    #[test]
    fn test_ready_clears_failure_state() {
        let state = manager();
        state.transition_to(ConnectionState::Connecting);
        state.set_error(&connection_error());
        state.set_error(&connection_error());
        assert_eq!(state.consecutive_failures(), 2);

        state.transition_to(ConnectionState::Ready);
        let info = state.connection_info();
        assert_eq!(info.consecutive_failures, 0);
        assert_eq!(info.retry_count, 0);
        assert!(!info.is_oauth_error);
        assert!(info.last_error.is_none());
        assert!(info.last_success_time.is_some());
        assert!(info.connected_at.is_some());
    }

    #[test]
    fn test_consecutive_failures_count_set_error_calls() {
        let state = manager();
        for n in 1..=5 {
            state.set_error(&connection_error());
            assert_eq!(state.consecutive_failures(), n);
        }
    }

    #[test]
    fn test_cancellation_not_counted() {
        let state = manager();
        state.set_error(&UpstreamError::cancelled("context canceled"));
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reset_preserves_failure_history() {
        let state = manager();
        state.transition_to(ConnectionState::Connecting);
        state.transition_to(ConnectionState::Ready);
        state.set_error(&connection_error());
        state.set_error(&connection_error());
        state.set_auto_disabled("kept failing");

        let before = state.connection_info();
        state.reset();
        let after = state.connection_info();

        assert_eq!(after.state, ConnectionState::Disconnected);
        assert_eq!(after.consecutive_failures, before.consecutive_failures);
        assert!(after.auto_disabled);
        assert_eq!(after.last_success_time, before.last_success_time);
        assert_eq!(after.first_attempt_time, before.first_attempt_time);
        // Transient fields cleared
        assert!(after.last_error.is_none());
        assert_eq!(after.retry_count, 0);
        assert!(!after.is_oauth_error);
        assert!(after.connected_at.is_none());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let state = manager();
        assert_eq!(state.backoff_delay(0), Duration::ZERO);
        assert_eq!(state.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(state.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(state.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(state.backoff_delay(9), Duration::from_secs(256));
        // Capped at the overall maximum (5 minutes)
        assert_eq!(state.backoff_delay(10), Duration::from_secs(300));
        assert_eq!(state.backoff_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_should_retry_honors_backoff() {
        let state = manager();

        // Not in Error state: never retry
        assert!(!state.should_retry());

        state.set_error(&connection_error());
        // One failure, 1s backoff, last retry was just now
        assert!(!state.should_retry());

        // A fresh manager with zero initial backoff retries immediately
        let mut backoff = BackoffConfig::default();
        backoff.initial = Duration::from_nanos(1);
        let state = manager_with(backoff);
        state.set_error(&connection_error());
        std::thread::sleep(Duration::from_millis(1));
        assert!(state.should_retry());
    }

    #[test]
    fn test_oauth_backoff_schedule() {
        assert_eq!(
            StateManager::oauth_backoff_delay(1),
            Duration::from_secs(5 * 60)
        );
        assert_eq!(
            StateManager::oauth_backoff_delay(2),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(
            StateManager::oauth_backoff_delay(3),
            Duration::from_secs(60 * 60)
        );
        assert_eq!(
            StateManager::oauth_backoff_delay(4),
            Duration::from_secs(4 * 60 * 60)
        );
        assert_eq!(
            StateManager::oauth_backoff_delay(5),
            Duration::from_secs(24 * 60 * 60)
        );
        // Beyond the schedule stays at the daily cap
        assert_eq!(
            StateManager::oauth_backoff_delay(12),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn test_should_retry_oauth_requires_oauth_error() {
        let state = manager();
        state.set_error(&connection_error());
        assert!(!state.should_retry_oauth());

        let state = manager();
        state.set_oauth_error(&UpstreamError::authorization_required("401"));
        // Last attempt was just now; 5 minute backoff applies
        assert!(!state.should_retry_oauth());
        assert!(state.is_oauth_error());
        assert_eq!(state.connection_info().oauth_retry_count, 1);
    }

    #[test]
    fn test_auto_disable_threshold() {
        let mut backoff = BackoffConfig::default();
        backoff.auto_disable_threshold = 3;
        backoff.startup_grace = Duration::ZERO;
        let state = manager_with(backoff);
        state.transition_to(ConnectionState::Connecting);

        state.set_error(&connection_error());
        state.set_error(&connection_error());
        assert!(!state.should_auto_disable());

        state.set_error(&connection_error());
        assert!(state.should_auto_disable());
    }

    #[test]
    fn test_auto_disable_doubled_during_grace() {
        let mut backoff = BackoffConfig::default();
        backoff.auto_disable_threshold = 3;
        backoff.startup_grace = Duration::from_secs(300);
        let state = manager_with(backoff);
        state.transition_to(ConnectionState::Connecting);
        assert!(state.is_in_grace_period());

        for _ in 0..3 {
            state.set_error(&connection_error());
        }
        // Within grace: threshold is doubled
        assert!(!state.should_auto_disable());

        for _ in 0..3 {
            state.set_error(&connection_error());
        }
        assert_eq!(state.consecutive_failures(), 6);
        assert!(state.should_auto_disable());
    }

    #[test]
    fn test_auto_disable_is_sticky_until_reset() {
        let mut backoff = BackoffConfig::default();
        backoff.auto_disable_threshold = 2;
        backoff.startup_grace = Duration::ZERO;
        let state = manager_with(backoff);
        state.transition_to(ConnectionState::Connecting);

        state.set_error(&connection_error());
        state.set_error(&connection_error());
        assert!(state.should_auto_disable());

        state.set_auto_disabled("2 consecutive failures");
        assert!(state.is_auto_disabled());
        assert_eq!(state.server_state(), ServerState::AutoDisabled);
        // Further failures never re-trigger
        state.set_error(&connection_error());
        assert!(!state.should_auto_disable());

        state.reset_auto_disable();
        assert!(!state.is_auto_disabled());
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_threshold_zero_disables_feature() {
        let mut backoff = BackoffConfig::default();
        backoff.auto_disable_threshold = 0;
        backoff.startup_grace = Duration::ZERO;
        let state = manager_with(backoff);

        for _ in 0..50 {
            state.set_error(&connection_error());
        }
        assert!(!state.should_auto_disable());
    }

    #[test]
    fn test_group_enable_clears_auto_disable() {
        let state = manager();
        state.set_error(&connection_error());
        state.set_auto_disabled("failing");
        assert_eq!(state.server_state(), ServerState::AutoDisabled);

        state.transition_server_state(ServerState::Active);
        let info = state.connection_info();
        assert!(!info.auto_disabled);
        assert_eq!(info.consecutive_failures, 0);
    }

    #[test]
    fn test_grace_period_remaining() {
        let mut backoff = BackoffConfig::default();
        backoff.startup_grace = Duration::from_secs(120);
        let state = manager_with(backoff);

        // Before any attempt the whole window remains
        assert_eq!(state.grace_period_remaining(), Duration::from_secs(120));

        state.transition_to(ConnectionState::Connecting);
        assert!(state.grace_period_remaining() <= Duration::from_secs(120));
        assert!(state.grace_period_remaining() > Duration::from_secs(100));
    }

    #[test]
    fn test_user_stopped_is_runtime_only() {
        let state = manager();
        assert!(!state.is_user_stopped());
        state.set_user_stopped(true);
        assert!(state.is_user_stopped());
        // Reset does not clear user intent
        state.reset();
        assert!(state.is_user_stopped());
        // And it never appears in the persisted snapshot
        let json = serde_json::to_value(state.connection_info()).unwrap();
        assert!(json.get("user_stopped").is_none());
    }

    #[tokio::test]
    async fn test_state_change_callback_fires() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let state = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        state.set_state_change_callback(Arc::new(move |_old, _new| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
        }));

        state.transition_to(ConnectionState::Connecting);
        state.transition_to(ConnectionState::Ready);

        // Callbacks are dispatched on their own task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

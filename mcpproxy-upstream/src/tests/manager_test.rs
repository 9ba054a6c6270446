//! Manager behavior: routing, startup orchestration, monitors

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_config::{BackoffConfig, ProxyConfig, ServerConfig};
use mcpproxy_interfaces::{MemoryOAuthEventQueue, OAuthToken};

use super::support::{fast_backoff, mock_deps, MockBehavior};
use crate::error::UpstreamError;
use crate::manager::UpstreamManager;
use crate::state::{ConnectionState, ServerState};

fn proxy_config(backoff: BackoffConfig) -> ProxyConfig {
    ProxyConfig {
        backoff,
        ..ProxyConfig::default()
    }
}

fn stdio_config(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, "mock-server", vec![])
}

#[tokio::test]
async fn test_routing_splits_on_first_colon() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior, fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    manager.add_server(stdio_config("demo")).await.unwrap();
    manager.connect_all().await.unwrap();

    let result = manager
        .call_tool("demo:add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();
    assert_eq!(result.text(), "5");

    // No delimiter: classification error
    let err = manager.call_tool("demoadd", json!({})).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Configuration { .. }));

    // Unknown server
    let err = manager.call_tool("ghost:add", json!({})).await.unwrap_err();
    assert!(matches!(err, UpstreamError::ToolNotFound { .. }));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_add_server_rejects_bad_names() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior, fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    assert!(manager.add_server(stdio_config("a:b")).await.is_err());
    assert!(manager.add_server(stdio_config("")).await.is_err());
    assert!(manager.add_server(stdio_config("fine")).await.is_ok());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_disabled_and_quarantined_servers_are_not_dialed() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior.clone(), fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    let mut disabled = stdio_config("disabled");
    disabled.enabled = false;
    let mut quarantined = stdio_config("quarantined");
    quarantined.quarantined = true;
    let mut lazy = stdio_config("lazy");
    lazy.start_on_boot = false;

    manager.add_server(disabled).await.unwrap();
    manager.add_server(quarantined).await.unwrap();
    manager.add_server(lazy).await.unwrap();
    manager.connect_all().await.unwrap();

    assert_eq!(behavior.transports_created.load(Ordering::SeqCst), 0);

    let servers = manager.list_servers().await;
    assert_eq!(servers.len(), 3);
    for (_, info) in &servers {
        assert_eq!(info.state, ConnectionState::Disconnected);
    }

    // The persisted states reflect the flags
    let disabled = manager.get_client("disabled").await.unwrap();
    assert_eq!(disabled.state_manager().server_state(), ServerState::Disabled);
    let quarantined = manager.get_client("quarantined").await.unwrap();
    assert_eq!(
        quarantined.state_manager().server_state(),
        ServerState::Quarantined
    );
    let lazy = manager.get_client("lazy").await.unwrap();
    assert_eq!(lazy.state_manager().server_state(), ServerState::LazyLoading);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_retries_failed_servers() {
    // Two failures, so phase 1 fails and the first phase-2 round succeeds
    let behavior = MockBehavior::failing_connects(2);
    let deps = mock_deps(behavior.clone(), fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    manager.add_server(stdio_config("flaky")).await.unwrap();
    manager.connect_all().await.unwrap();

    let client = manager.get_client("flaky").await.unwrap();
    assert!(client.is_connected());
    // phase 1 + retry rounds until success; two failures -> third wins.
    // A supervisor-driven reconnect may add one more in paused time, so
    // bound rather than pin the count.
    let initializes = behavior.initializes.load(Ordering::SeqCst);
    assert!((3..=4).contains(&initializes), "got {}", initializes);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_bounds_retry_rounds() {
    let behavior = MockBehavior::always_failing();
    let backoff = BackoffConfig {
        initial: Duration::from_millis(1),
        startup_grace: Duration::ZERO,
        auto_disable_threshold: 0, // isolate the retry-round count
        ..BackoffConfig::default()
    };
    let deps = mock_deps(behavior.clone(), backoff.clone());
    let manager = UpstreamManager::new(&proxy_config(backoff), deps);

    manager.add_server(stdio_config("dead")).await.unwrap();
    manager.connect_all().await.unwrap();

    // Phase 1 plus at most 5 retry rounds
    assert_eq!(behavior.initializes.load(Ordering::SeqCst), 6);

    let client = manager.get_client("dead").await.unwrap();
    assert!(!client.is_connected());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistent_startup_failure_auto_disables() {
    let behavior = MockBehavior::always_failing();
    let backoff = BackoffConfig {
        initial: Duration::from_millis(1),
        startup_grace: Duration::ZERO,
        auto_disable_threshold: 3,
        ..BackoffConfig::default()
    };
    let deps = mock_deps(behavior, backoff.clone());
    let manager = UpstreamManager::new(&proxy_config(backoff), deps);

    let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let fired_in_cb = fired.clone();
    manager.set_server_auto_disable_callback(Arc::new(move |server, reason| {
        assert_eq!(server, "dead");
        assert!(!reason.is_empty());
        fired_in_cb.fetch_add(1, Ordering::SeqCst);
    }));

    manager.add_server(stdio_config("dead")).await.unwrap();
    manager.connect_all().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = manager.get_client("dead").await.unwrap();
    assert!(client.state_manager().is_auto_disabled());
    assert_eq!(
        client.state_manager().server_state(),
        ServerState::AutoDisabled
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_detection_reconnects_oauth_errored_server() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior.clone(), fast_backoff());
    let token_store = deps.token_store.clone();
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    manager.add_server(stdio_config("gh")).await.unwrap();
    let client = manager.get_client("gh").await.unwrap();

    // Server sits in OAuth error; the 5-minute backoff would apply
    client
        .state_manager()
        .set_oauth_error(&UpstreamError::authorization_required("401 Unauthorized"));
    assert!(!client.state_manager().should_retry_oauth());

    manager.start_monitors();

    // A token appears (written by an external CLI flow)
    token_store
        .put("gh", OAuthToken::bearer("fresh-token"))
        .await
        .unwrap();

    // The 5s monitor picks it up well before the 5-minute backoff
    let mut ready = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if client.is_connected() {
            ready = true;
            break;
        }
    }
    assert!(ready, "token detection should bypass the OAuth backoff");

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_oauth_queue_completion_triggers_reconnect() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior, fast_backoff());
    let queue = Arc::new(MemoryOAuthEventQueue::new());
    let manager =
        UpstreamManager::new(&proxy_config(fast_backoff()), deps).with_oauth_queue(queue.clone());

    manager.add_server(stdio_config("notion")).await.unwrap();
    let client = manager.get_client("notion").await.unwrap();
    client
        .state_manager()
        .set_oauth_error(&UpstreamError::authorization_required("401"));

    manager.start_monitors();
    queue.push("notion").await;

    let mut ready = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if client.is_connected() {
            ready = true;
            break;
        }
    }
    assert!(ready, "queued completion should trigger a reconnect");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_server_disconnects() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior.clone(), fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    manager.add_server(stdio_config("demo")).await.unwrap();
    manager.connect_all().await.unwrap();
    assert!(manager.get_client("demo").await.unwrap().is_connected());

    assert!(manager.remove_server("demo").await);
    assert!(manager.get_client("demo").await.is_none());
    assert!(!manager.remove_server("demo").await);
    assert_eq!(behavior.transports_closed.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_list_tools_aggregates_with_prefixes() {
    let behavior = MockBehavior::new();
    let deps = mock_deps(behavior, fast_backoff());
    let manager = UpstreamManager::new(&proxy_config(fast_backoff()), deps);

    manager.add_server(stdio_config("alpha")).await.unwrap();
    manager.add_server(stdio_config("beta")).await.unwrap();
    manager.connect_all().await.unwrap();

    let tools = manager.list_tools().await;
    let names: Vec<_> = tools.iter().map(|t| t.public_name.as_str()).collect();
    assert_eq!(names, vec!["alpha:add", "beta:add"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_connection_bypasses_backoff() {
    let behavior = MockBehavior::failing_connects(1);
    // Enormous initial backoff: the supervisor would wait a long time
    let backoff = BackoffConfig {
        initial: Duration::from_secs(3600),
        startup_grace: Duration::ZERO,
        ..BackoffConfig::default()
    };
    let deps = mock_deps(behavior, backoff.clone());
    let manager = UpstreamManager::new(&proxy_config(backoff), deps);

    manager.add_server(stdio_config("demo")).await.unwrap();
    let client = manager.get_client("demo").await.unwrap();
    let _ = client.connect().await; // fails once
    assert!(!client.state_manager().should_retry());

    // Manual trigger ignores the backoff clock
    manager.retry_connection("demo").await.unwrap();
    assert!(client.is_connected());

    manager.shutdown().await;
}

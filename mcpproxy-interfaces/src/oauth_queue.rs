//! OAuth completion queue interface
//!
//! Authorization flows can finish outside the proxy process (a CLI login,
//! another instance). The embedder persists a completion record; the
//! manager drains this queue periodically and retries the named servers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Record of an OAuth flow completed out-of-process
#[derive(Debug, Clone)]
pub struct OAuthCompletion {
    pub server_name: String,
    pub completed_at: DateTime<Utc>,
}

/// Queue of pending OAuth completion records
#[async_trait]
pub trait OAuthEventQueue: Send + Sync {
    /// Remove and return all pending completion records
    async fn drain(&self) -> Vec<OAuthCompletion>;
}

/// In-memory queue for tests and single-process embedders
#[derive(Default)]
pub struct MemoryOAuthEventQueue {
    pending: Mutex<Vec<OAuthCompletion>>,
}

impl MemoryOAuthEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a completion record
    pub async fn push(&self, server_name: impl Into<String>) {
        self.pending.lock().await.push(OAuthCompletion {
            server_name: server_name.into(),
            completed_at: Utc::now(),
        });
    }
}

#[async_trait]
impl OAuthEventQueue for MemoryOAuthEventQueue {
    async fn drain(&self) -> Vec<OAuthCompletion> {
        std::mem::take(&mut *self.pending.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let queue = MemoryOAuthEventQueue::new();
        queue.push("gh").await;
        queue.push("notion").await;

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].server_name, "gh");

        assert!(queue.drain().await.is_empty());
    }
}

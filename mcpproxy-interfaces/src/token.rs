//! OAuth token persistence interface
//!
//! Tokens are keyed by server name. Stores must be safe for concurrent use
//! across clients; the file-backed implementation keeps one file per server
//! and serializes access to each file independently.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Result type for token store operations
pub type TokenStoreResult<T> = Result<T, TokenStoreError>;

/// Errors raised by token store implementations
#[derive(Error, Debug)]
pub enum TokenStoreError {
    /// IO error reading or writing a token file
    #[error("Token store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Token (de)serialization error
    #[error("Token serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server name unusable as a storage key
    #[error("Invalid server name for token storage: {name}")]
    InvalidServerName { name: String },
}

/// An OAuth 2.1 token as persisted by the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Access token presented as a bearer credential
    pub access_token: String,

    /// Refresh token, when the authorization server issued one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type; effectively always "Bearer"
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Absolute expiry time, if the token expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted by the authorization server
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Clock skew tolerated when deciding whether a token is still usable
const EXPIRY_SKEW_SECS: i64 = 30;

impl OAuthToken {
    /// Create a bearer token without expiry metadata
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    /// Whether the token is expired (with a small skew allowance)
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }

    /// Whether this token can be refreshed without user interaction
    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Token persistence keyed by server name
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch the stored token for a server, if any
    async fn get(&self, server_name: &str) -> TokenStoreResult<Option<OAuthToken>>;

    /// Store (or replace) the token for a server
    async fn put(&self, server_name: &str, token: OAuthToken) -> TokenStoreResult<()>;

    /// Remove the token for a server; removing a missing token is not an error
    async fn delete(&self, server_name: &str) -> TokenStoreResult<()>;
}

/// In-memory token store for tests and ephemeral embedders
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, server_name: &str) -> TokenStoreResult<Option<OAuthToken>> {
        Ok(self.tokens.read().await.get(server_name).cloned())
    }

    async fn put(&self, server_name: &str, token: OAuthToken) -> TokenStoreResult<()> {
        self.tokens
            .write()
            .await
            .insert(server_name.to_string(), token);
        Ok(())
    }

    async fn delete(&self, server_name: &str) -> TokenStoreResult<()> {
        self.tokens.write().await.remove(server_name);
        Ok(())
    }
}

/// File-backed token store: one JSON file per server under a directory.
///
/// Access to each file goes through a per-server async lock so concurrent
/// clients never interleave a read with a partial write.
pub struct FileTokenStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn token_path(&self, server_name: &str) -> TokenStoreResult<PathBuf> {
        if server_name.is_empty()
            || server_name
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(TokenStoreError::InvalidServerName {
                name: server_name.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.json", server_name)))
    }

    async fn file_lock(&self, server_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(server_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, server_name: &str) -> TokenStoreResult<Option<OAuthToken>> {
        let path = self.token_path(server_name)?;
        let lock = self.file_lock(server_name).await;
        let _guard = lock.lock().await;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, server_name: &str, token: OAuthToken) -> TokenStoreResult<()> {
        let path = self.token_path(server_name)?;
        let lock = self.file_lock(server_name).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(&token)?;
        tokio::fs::write(&path, bytes).await?;

        // Tokens are credentials; keep them out of reach of other users.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        Ok(())
    }

    async fn delete(&self, server_name: &str) -> TokenStoreResult<()> {
        let path = self.token_path(server_name)?;
        let lock = self.file_lock(server_name).await;
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry() {
        let mut token = OAuthToken::bearer("abc");
        assert!(!token.is_expired());

        token.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!token.is_expired());

        token.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(token.is_expired());

        // Within the skew window counts as expired
        token.expires_at = Some(Utc::now() + Duration::seconds(10));
        assert!(token.is_expired());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryTokenStore::new();
        assert!(store.get("github").await.unwrap().is_none());

        store
            .put("github", OAuthToken::bearer("tok-1"))
            .await
            .unwrap();
        let fetched = store.get("github").await.unwrap().unwrap();
        assert_eq!(fetched.access_token, "tok-1");

        store.delete("github").await.unwrap();
        assert!(store.get("github").await.unwrap().is_none());

        // Deleting again is fine
        store.delete("github").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());

        assert!(store.get("notion").await.unwrap().is_none());

        let mut token = OAuthToken::bearer("tok-2");
        token.refresh_token = Some("refresh-2".to_string());
        store.put("notion", token.clone()).await.unwrap();

        let fetched = store.get("notion").await.unwrap().unwrap();
        assert_eq!(fetched, token);

        store.delete("notion").await.unwrap();
        assert!(store.get("notion").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());

        let result = store.get("../etc/passwd").await;
        assert!(matches!(
            result,
            Err(TokenStoreError::InvalidServerName { .. })
        ));
    }
}

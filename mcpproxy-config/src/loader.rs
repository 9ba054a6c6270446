//! Configuration loading
//!
//! YAML file, then environment overrides, then validation.

use crate::error::{ConfigError, ConfigResult};
use crate::server::ProxyConfig;
use crate::validation::Validatable;
use std::path::Path;
use std::time::Duration;

/// Loads and validates proxy configuration
#[derive(Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate the result
    pub async fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ProxyConfig> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        self.from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(&self, content: &str) -> ConfigResult<ProxyConfig> {
        let config: ProxyConfig = serde_yaml::from_str(content)?;
        let config = self.apply_env_overrides(config)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MCPPROXY_*` environment variable overrides
    fn apply_env_overrides(&self, mut config: ProxyConfig) -> ConfigResult<ProxyConfig> {
        if let Ok(value) = std::env::var("MCPPROXY_AUTO_DISABLE_THRESHOLD") {
            config.backoff.auto_disable_threshold =
                value.parse().map_err(|_| ConfigError::EnvError(format!(
                    "MCPPROXY_AUTO_DISABLE_THRESHOLD must be an integer, got '{}'",
                    value
                )))?;
        }

        if let Ok(value) = std::env::var("MCPPROXY_STARTUP_CONCURRENCY") {
            config.backoff.startup_concurrency =
                value.parse().map_err(|_| ConfigError::EnvError(format!(
                    "MCPPROXY_STARTUP_CONCURRENCY must be an integer, got '{}'",
                    value
                )))?;
        }

        if let Ok(value) = std::env::var("MCPPROXY_STARTUP_GRACE_SECS") {
            let secs: u64 = value.parse().map_err(|_| ConfigError::EnvError(format!(
                "MCPPROXY_STARTUP_GRACE_SECS must be an integer, got '{}'",
                value
            )))?;
            config.backoff.startup_grace = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var("MCPPROXY_DOCKER_ISOLATION") {
            config.docker_isolation = matches!(value.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Protocol;

    #[test]
    fn test_minimal_yaml() {
        let yaml = r#"
servers:
  - name: demo
    protocol: stdio
    command: npx
    args: ["-y", "@demo/server"]
  - name: gh
    protocol: streamable-http
    url: https://api.example.com/mcp
    health_check: true
"#;
        let config = ConfigLoader::new().from_yaml(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "demo");
        assert_eq!(config.servers[1].protocol, Protocol::StreamableHttp);
        assert!(config.servers[1].health_check);
        // Policy defaults filled in
        assert_eq!(config.backoff.auto_disable_threshold, 7);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let yaml = r#"
servers:
  - name: bad
    protocol: http
"#;
        // http without a url fails validation
        assert!(ConfigLoader::new().from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcpproxy.yaml");
        tokio::fs::write(&path, "servers: []\n").await.unwrap();

        let config = ConfigLoader::new().from_file(&path).await.unwrap();
        assert!(config.servers.is_empty());

        assert!(ConfigLoader::new()
            .from_file(dir.path().join("missing.yaml"))
            .await
            .is_err());
    }
}

//! Timeout and backoff policy configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operation deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Per-connection deadline for stdio servers
    #[serde(with = "humantime_serde")]
    pub connect: Duration,

    /// Per-connection deadline for HTTP-family servers
    #[serde(with = "humantime_serde")]
    pub connect_http: Duration,

    /// Quick operations: status queries, short probes
    #[serde(with = "humantime_serde")]
    pub quick: Duration,

    /// Tool discovery (`tools/list`)
    #[serde(with = "humantime_serde")]
    pub tools_list: Duration,

    /// Active health probe issued by the supervisor loop
    #[serde(with = "humantime_serde")]
    pub health_probe: Duration,

    /// Whole-fleet startup dial phase
    #[serde(with = "humantime_serde")]
    pub startup_batch: Duration,

    /// Interactive OAuth authorization (user in the loop)
    #[serde(with = "humantime_serde")]
    pub oauth_flow: Duration,

    /// Grace between closing a child's stdin and killing it
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            connect_http: default_connect_http(),
            quick: default_quick(),
            tools_list: default_tools_list(),
            health_probe: default_health_probe(),
            startup_batch: default_startup_batch(),
            oauth_flow: default_oauth_flow(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Timeouts {
    /// Connect deadline for the given transport family
    pub fn connect_for(&self, http_based: bool) -> Duration {
        if http_based {
            self.connect_http
        } else {
            self.connect
        }
    }
}

impl Validatable for Timeouts {
    fn validate(&self) -> ConfigResult<()> {
        if self.connect.is_zero() || self.connect_http.is_zero() {
            return Err(self.validation_error("connect timeouts cannot be zero"));
        }
        if self.tools_list.is_zero() {
            return Err(self.validation_error("tools_list timeout cannot be zero"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "timeouts"
    }
}

/// Retry, backoff, and auto-disable policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay; doubles per consecutive failure
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Cap applied per-attempt during startup retry rounds
    #[serde(with = "humantime_serde")]
    pub per_retry_cap: Duration,

    /// Overall cap on the exponential reconnect backoff
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Cooldown between token-detection reconnects for one server
    #[serde(with = "humantime_serde")]
    pub token_reconnect_cooldown: Duration,

    /// Global default for consecutive failures before auto-disable
    pub auto_disable_threshold: u32,

    /// Window after the first connection attempt during which auto-disable
    /// requires double the threshold
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,

    /// Per-client supervisor tick interval
    #[serde(with = "humantime_serde")]
    pub health_loop_interval: Duration,

    /// Manager-level reconnect sweep interval
    #[serde(with = "humantime_serde")]
    pub manager_health_interval: Duration,

    /// OAuth queue / token store scan interval
    #[serde(with = "humantime_serde")]
    pub oauth_monitor_interval: Duration,

    /// Concurrent dials during startup
    pub startup_concurrency: usize,

    /// Retry rounds for servers that failed the initial dial
    pub startup_retry_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            per_retry_cap: default_per_retry_cap(),
            max: default_max_backoff(),
            token_reconnect_cooldown: default_token_cooldown(),
            auto_disable_threshold: default_auto_disable_threshold(),
            startup_grace: default_startup_grace(),
            health_loop_interval: default_health_loop_interval(),
            manager_health_interval: default_manager_health_interval(),
            oauth_monitor_interval: default_oauth_monitor_interval(),
            startup_concurrency: default_startup_concurrency(),
            startup_retry_attempts: default_startup_retry_attempts(),
        }
    }
}

impl Validatable for BackoffConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.initial.is_zero() {
            return Err(self.validation_error("initial backoff cannot be zero"));
        }
        if self.max < self.initial {
            return Err(self.validation_error("max backoff cannot be below initial"));
        }
        if self.startup_concurrency == 0 {
            return Err(self.validation_error("startup_concurrency cannot be zero"));
        }
        if self.startup_retry_attempts == 0 {
            return Err(self.validation_error("startup_retry_attempts cannot be zero"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "backoff"
    }
}

// Default value functions
fn default_connect() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_http() -> Duration {
    Duration::from_secs(180)
}

fn default_quick() -> Duration {
    Duration::from_secs(10)
}

fn default_tools_list() -> Duration {
    Duration::from_secs(30)
}

fn default_health_probe() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_batch() -> Duration {
    Duration::from_secs(120)
}

fn default_oauth_flow() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_per_retry_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_token_cooldown() -> Duration {
    Duration::from_secs(10)
}

fn default_auto_disable_threshold() -> u32 {
    7
}

fn default_startup_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_health_loop_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_manager_health_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_oauth_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_concurrency() -> usize {
    20
}

fn default_startup_retry_attempts() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect, Duration::from_secs(60));
        assert_eq!(timeouts.connect_for(true), Duration::from_secs(180));
        assert_eq!(timeouts.connect_for(false), Duration::from_secs(60));
        assert!(timeouts.validate().is_ok());

        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(300));
        assert_eq!(backoff.auto_disable_threshold, 7);
        assert_eq!(backoff.startup_concurrency, 20);
        assert!(backoff.validate().is_ok());
    }

    #[test]
    fn test_backoff_validation() {
        let mut backoff = BackoffConfig::default();
        backoff.max = Duration::from_millis(100);
        assert!(backoff.validate().is_err());

        let mut backoff = BackoffConfig::default();
        backoff.startup_concurrency = 0;
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_humantime_round_trip() {
        let yaml = "initial: 2s\nmax: 10m\n";
        let parsed: BackoffConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.initial, Duration::from_secs(2));
        assert_eq!(parsed.max, Duration::from_secs(600));
        // Untouched fields keep their defaults
        assert_eq!(parsed.auto_disable_threshold, 7);
    }
}

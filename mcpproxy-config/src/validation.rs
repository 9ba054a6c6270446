//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a URL
pub fn validate_url(url: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if url.is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }

    url::Url::parse(url)?;
    Ok(())
}

/// Validate a loopback port range used for OAuth callbacks
pub fn validate_port_range(range: (u16, u16), field_name: &str, domain: &str) -> ConfigResult<()> {
    let (low, high) = range;
    if low == 0 || high == 0 {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot include port 0", field_name),
        });
    }
    if low > high {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} lower bound {} exceeds upper bound {}", field_name, low, high),
        });
    }
    if low <= 1023 {
        tracing::warn!("{} starts in the reserved range (1-1023)", field_name);
    }
    Ok(())
}

use axum::http::HeaderName;
use validator::Validate;

use crate::config::{Channel, Config, IdentityConfig, StorageConfig};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::key_generator::IpMatcher;
use crate::rate_limit_config::QuotaConfig;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the whole service configuration. Any failure means the
    /// guard must not start.
    pub fn validate_config(config: &Config) -> ThrottlerResult<()> {
        config.validate()?;
        Self::validate_quota(&config.quota)?;
        Self::validate_storage(&config.storage)?;
        Self::validate_identity(&config.identity)?;
        Ok(())
    }

    /// Validates quota parameters
    pub fn validate_quota(quota: &QuotaConfig) -> ThrottlerResult<()> {
        quota.validate()?;
        quota
            .validate_quota()
            .map_err(ThrottlerError::ConfigurationError)
    }

    /// Validates storage limits
    pub fn validate_storage(storage: &StorageConfig) -> ThrottlerResult<()> {
        storage.validate()?;

        if storage.cleanup_interval.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Cleanup interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates channel settings, list entries and header names
    pub fn validate_identity(identity: &IdentityConfig) -> ThrottlerResult<()> {
        if identity.ip.is_disabled() && identity.key.is_disabled() {
            return Err(ThrottlerError::ConfigurationError(
                "At least one identity channel must be enabled".to_string(),
            ));
        }

        if let Channel::Custom(ip) = &identity.ip {
            IpMatcher::parse(&ip.allow_list, "ip allow_list")?;
            IpMatcher::parse(&ip.block_list, "ip block_list")?;
            IpMatcher::parse(&ip.trusted_proxies, "trusted_proxies")?;
            Self::validate_header_name(&ip.forwarded_header)?;

            if ip.trust_forwarded_chain && ip.trusted_proxies.is_empty() {
                return Err(ThrottlerError::ConfigurationError(
                    "trust_forwarded_chain requires at least one trusted proxy".to_string(),
                ));
            }
        }

        if let Channel::Custom(key) = &identity.key {
            Self::validate_header_name(&key.header)?;

            if key.query_param.trim().is_empty() {
                return Err(ThrottlerError::ConfigurationError(
                    "Key query parameter name cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Validates an HTTP header name
    pub fn validate_header_name(name: &str) -> ThrottlerResult<()> {
        if name.trim().is_empty() {
            return Err(ThrottlerError::ConfigurationError(
                "Header name cannot be empty".to_string(),
            ));
        }

        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ThrottlerError::ConfigurationError(format!("Invalid header name '{}'", name))
        })?;

        Ok(())
    }
}

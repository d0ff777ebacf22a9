//! Configuration validation
//!
//! Checks a followgraph configuration for values the cache cannot work with:
//! - zero TTLs or sweep interval
//! - a zero-capacity change channel
//! - a storage key the chosen backend cannot store
//! - a remote base URL that is not http(s)

use super::followgraph_config::{FollowGraphConfig, PersistenceBackend};
use crate::FollowGraphError;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a followgraph configuration
pub fn validate_config(config: &FollowGraphConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let cache = &config.cache;
    if cache.follow_ttl_secs == 0 {
        errors.push(ValidationError::new("cache.follow_ttl_secs", "must be greater than zero"));
    }
    if cache.stats_ttl_secs == 0 {
        errors.push(ValidationError::new("cache.stats_ttl_secs", "must be greater than zero"));
    }
    if cache.sweep_interval_secs == 0 {
        errors.push(ValidationError::new(
            "cache.sweep_interval_secs",
            "must be greater than zero",
        ));
    }
    if cache.change_channel_capacity == 0 {
        errors.push(ValidationError::new(
            "cache.change_channel_capacity",
            "must be greater than zero",
        ));
    }
    if cache.storage_key.trim().is_empty() {
        errors.push(ValidationError::new("cache.storage_key", "must not be empty"));
    } else if config.persistence.backend == PersistenceBackend::JsonFile
        && !cache
            .storage_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        errors.push(ValidationError::new(
            "cache.storage_key",
            "json_file backend needs a key made of letters, digits, '-', '_' or '.'",
        ));
    }

    if config.persistence.backend != PersistenceBackend::Memory
        && config.persistence.path.as_os_str().is_empty()
    {
        errors.push(ValidationError::new("persistence.path", "must not be empty"));
    }

    if let Some(ref url) = config.remote.base_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(ValidationError::new(
                "remote.base_url",
                format!("must start with http:// or https:// (got {})", url),
            ));
        }
    }
    if config.remote.poll_interval_secs == 0 {
        errors.push(ValidationError::new(
            "remote.poll_interval_secs",
            "must be greater than zero",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and fold all problems into a single config error
pub fn validate_config_result(config: &FollowGraphConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        FollowGraphError::Config(joined)
    })
}

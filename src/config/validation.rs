//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`DecoderConfig`] that the type
//! system cannot express: zero sizes, malformed bypass paths, unknown or
//! repeated provider names.
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::{DecoderConfig, KNOWN_PROVIDERS};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "offload.workers").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn require_nonzero(errors: &mut Vec<ConfigError>, field: &str, value: u64, reason: &str) {
    if value == 0 {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: "0".into(),
            reason: reason.into(),
        });
    }
}

/// Validate all semantic constraints on a [`DecoderConfig`].
///
/// Collects every violation before returning.
///
/// # Errors
///
/// Returns every [`ConfigError::InvalidField`] found.
pub fn validate(config: &DecoderConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ──────────────────────────────────────────────────────
    if config.server.host.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "server.host".into(),
            value: String::new(),
            reason: "host must not be empty".into(),
        });
    }
    require_nonzero(
        &mut errors,
        "server.max_request_size",
        config.server.max_request_size as u64,
        "request size limit must be at least 1 byte",
    );

    // ── Rate limit ──────────────────────────────────────────────────
    let rl = &config.rate_limit;
    if rl.enabled {
        require_nonzero(
            &mut errors,
            "rate_limit.requests_per_window",
            rl.requests_per_window as u64,
            "capacity must be at least 1 when rate limiting is enabled",
        );
        require_nonzero(
            &mut errors,
            "rate_limit.window_secs",
            rl.window_secs,
            "window must be at least 1s when rate limiting is enabled",
        );
    }
    // The sweeper runs even when the gate is disabled.
    require_nonzero(
        &mut errors,
        "rate_limit.sweep_interval_secs",
        rl.sweep_interval_secs,
        "sweep interval must be at least 1s",
    );
    for path in &rl.bypass_paths {
        if path.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: "rate_limit.bypass_paths".into(),
                value: format!("{path:?}"),
                reason: "bypass path must not be empty".into(),
            });
        } else if !path.starts_with('/') {
            errors.push(ConfigError::InvalidField {
                field: "rate_limit.bypass_paths".into(),
                value: path.clone(),
                reason: "bypass path must start with '/'".into(),
            });
        }
    }

    // ── Offload / background ────────────────────────────────────────
    require_nonzero(
        &mut errors,
        "offload.workers",
        config.offload.workers as u64,
        "offload pool needs at least 1 worker",
    );

    // ── Providers ───────────────────────────────────────────────────
    require_nonzero(
        &mut errors,
        "providers.timeout_secs",
        config.providers.timeout_secs,
        "provider timeout must be at least 1s",
    );
    for (name, endpoint) in [
        ("huggingface", &config.providers.huggingface),
        ("openai", &config.providers.openai),
        ("stability", &config.providers.stability),
    ] {
        if endpoint.timeout_secs == Some(0) {
            errors.push(ConfigError::InvalidField {
                field: format!("providers.{name}.timeout_secs"),
                value: "0".into(),
                reason: "provider timeout must be at least 1s".into(),
            });
        }
    }
    let mut seen = HashSet::new();
    for name in &config.providers.order {
        if !KNOWN_PROVIDERS.contains(&name.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: "providers.order".into(),
                value: name.clone(),
                reason: format!("unknown provider, expected one of {KNOWN_PROVIDERS:?}"),
            });
        } else if !seen.insert(name.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: "providers.order".into(),
                value: name.clone(),
                reason: "provider listed more than once".into(),
            });
        }
    }

    // ── History ─────────────────────────────────────────────────────
    require_nonzero(
        &mut errors,
        "history.ttl_secs",
        config.history.ttl_secs,
        "history TTL must be at least 1s",
    );
    require_nonzero(
        &mut errors,
        "history.source_timeout_ms",
        config.history.source_timeout_ms,
        "history source timeout must be at least 1ms",
    );
    require_nonzero(
        &mut errors,
        "history.limit",
        config.history.limit as u64,
        "history limit must be at least 1",
    );
    require_nonzero(
        &mut errors,
        "history.max_records",
        config.history.max_records as u64,
        "stored prediction capacity must be at least 1",
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_field(errors: &[ConfigError], wanted: &str) -> bool {
        errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidField { field, .. } if field == wanted))
    }

    #[test]
    fn test_validate_default_config_passes() {
        assert!(validate(&DecoderConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let mut config = DecoderConfig::default();
        config.offload.workers = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "offload.workers"));
    }

    #[test]
    fn test_validate_zero_capacity_fails_when_enabled() {
        let mut config = DecoderConfig::default();
        config.rate_limit.requests_per_window = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.requests_per_window"));
    }

    #[test]
    fn test_validate_zero_capacity_passes_when_disabled() {
        let mut config = DecoderConfig::default();
        config.rate_limit.enabled = false;
        config.rate_limit.requests_per_window = 0;
        config.rate_limit.window_secs = 0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_window_fails() {
        let mut config = DecoderConfig::default();
        config.rate_limit.window_secs = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.window_secs"));
    }

    #[test]
    fn test_validate_zero_sweep_interval_fails() {
        let mut config = DecoderConfig::default();
        config.rate_limit.sweep_interval_secs = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.sweep_interval_secs"));
    }

    #[test]
    fn test_validate_zero_sweep_interval_fails_when_disabled() {
        let mut config = DecoderConfig::default();
        config.rate_limit.enabled = false;
        config.rate_limit.sweep_interval_secs = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.sweep_interval_secs"));
    }

    #[test]
    fn test_validate_zero_provider_timeout_override_fails() {
        let mut config = DecoderConfig::default();
        config.providers.openai.timeout_secs = Some(0);
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "providers.openai.timeout_secs"));
        assert!(!has_field(&errors, "providers.timeout_secs"));
    }

    #[test]
    fn test_validate_history_zero_max_records_fails() {
        let mut config = DecoderConfig::default();
        config.history.max_records = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "history.max_records"));
    }

    #[test]
    fn test_validate_relative_bypass_path_fails() {
        let mut config = DecoderConfig::default();
        config.rate_limit.bypass_paths.push("health".into());
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.bypass_paths"));
    }

    #[test]
    fn test_validate_empty_bypass_path_fails() {
        let mut config = DecoderConfig::default();
        config.rate_limit.bypass_paths.push("  ".into());
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "rate_limit.bypass_paths"));
    }

    #[test]
    fn test_validate_unknown_provider_fails() {
        let mut config = DecoderConfig::default();
        config.providers.order = vec!["openai".into(), "midjourney".into()];
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("midjourney"));
    }

    #[test]
    fn test_validate_duplicate_provider_fails() {
        let mut config = DecoderConfig::default();
        config.providers.order = vec!["openai".into(), "openai".into()];
        let errors = validate(&config).unwrap_err();
        assert!(errors[0].to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_empty_provider_order_passes() {
        let mut config = DecoderConfig::default();
        config.providers.order.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_provider_timeout_fails() {
        let mut config = DecoderConfig::default();
        config.providers.timeout_secs = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "providers.timeout_secs"));
    }

    #[test]
    fn test_validate_history_zero_values_fail() {
        let mut config = DecoderConfig::default();
        config.history.ttl_secs = 0;
        config.history.source_timeout_ms = 0;
        config.history.limit = 0;
        let errors = validate(&config).unwrap_err();
        assert!(has_field(&errors, "history.ttl_secs"));
        assert!(has_field(&errors, "history.source_timeout_ms"));
        assert!(has_field(&errors, "history.limit"));
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut config = DecoderConfig::default();
        config.server.host = String::new();
        config.server.max_request_size = 0;
        config.offload.workers = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_config_error_invalid_field_display() {
        let err = ConfigError::InvalidField {
            field: "offload.workers".into(),
            value: "0".into(),
            reason: "offload pool needs at least 1 worker".into(),
        };
        assert_eq!(
            err.to_string(),
            "Field 'offload.workers' has invalid value 0: offload pool needs at least 1 worker"
        );
    }

    #[test]
    fn test_config_error_io_display_names_file() {
        let err = ConfigError::Io {
            file: "missing.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("missing.toml"));
    }
}

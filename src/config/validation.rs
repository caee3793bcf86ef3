//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses and value ranges
//! - Check that TLS material is named when a listener is secure
//! - Compile proxy patterns and header rules once, so assembly cannot fail on them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{OptionGroup, ServerConfig};
use crate::http::response_headers::HeaderRules;
use crate::security::TrustedProxies;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: `{value}` is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: &'static str },

    #[error("{field} is required when {condition}")]
    Missing { field: &'static str, condition: &'static str },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn check_address(field: &'static str, value: &str, errors: &mut Vec<ValidationError>) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

/// Checks a parsed configuration, collecting every problem.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address("listener.bind_address", &config.listener.bind_address, &mut errors);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::OutOfRange {
            field: "listener.max_connections",
            reason: "must be greater than 0",
        });
    }

    if config.observability.metrics_enabled {
        check_address("observability.metrics_address", &config.observability.metrics_address, &mut errors);
    }

    if let Some(http) = OptionGroup::effective(&config.http_options) {
        if http.message_size_limit < -1 {
            errors.push(ValidationError::OutOfRange {
                field: "http_options.message_size_limit",
                reason: "must be -1 (unbounded) or a byte count",
            });
        }
        if http.chunk_size == 0 {
            errors.push(ValidationError::OutOfRange {
                field: "http_options.chunk_size",
                reason: "must be greater than 0",
            });
        }
        if http.max_head_size < 64 {
            errors.push(ValidationError::OutOfRange {
                field: "http_options.max_head_size",
                reason: "must be at least 64 bytes",
            });
        }
    }

    if config.listener.secure {
        let ssl = &config.ssl_options;
        if ssl.cert_path.is_none() {
            errors.push(ValidationError::Missing {
                field: "ssl_options.cert_path",
                condition: "listener.secure is set",
            });
        }
        if ssl.key_path.is_none() {
            errors.push(ValidationError::Missing {
                field: "ssl_options.key_path",
                condition: "listener.secure is set",
            });
        }
    }

    if let Some(remote_ip) = OptionGroup::effective(&config.remote_ip) {
        if let Err(e) = TrustedProxies::new(&remote_ip.proxies) {
            errors.push(ValidationError::Invalid {
                field: "remote_ip.proxies",
                reason: e.to_string(),
            });
        }
    }

    if let Some(compression) = OptionGroup::effective(&config.compression) {
        if compression.level > 9 {
            errors.push(ValidationError::OutOfRange {
                field: "compression.level",
                reason: "must be between 0 and 9",
            });
        }
    }

    if let Some(headers) = OptionGroup::effective(&config.headers) {
        if let Err(e) = HeaderRules::try_from(&headers) {
            errors.push(ValidationError::Invalid {
                field: "headers",
                reason: e.to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{HeadersOptions, HttpOptions, RemoteIpOptions};

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn every_error_is_reported() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not an address".into();
        config.listener.max_connections = 0;
        config.listener.secure = true;
        config.http_options = Some(HttpOptions {
            message_size_limit: -5,
            ..HttpOptions::default()
        });
        config.remote_ip = Some(RemoteIpOptions {
            proxies: "(unclosed".into(),
            ..RemoteIpOptions::default()
        });
        config.headers = Some(HeadersOptions {
            add: vec!["broken".into()],
            ..HeadersOptions::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 7);
        assert!(errors.contains(&ValidationError::Missing {
            field: "ssl_options.key_path",
            condition: "listener.secure is set",
        }));
    }

    #[test]
    fn groups_with_default_id_are_not_checked() {
        let mut config = ServerConfig::default();
        config.remote_ip = Some(RemoteIpOptions {
            id: Some("defaultRemoteIp".into()),
            proxies: "(unclosed".into(),
            ..RemoteIpOptions::default()
        });
        assert_eq!(validate_config(&config), Ok(()));
    }
}

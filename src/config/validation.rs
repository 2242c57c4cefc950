//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (queues > 0, addresses parse)
//! - Detect duplicate credentials
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {}", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let ws = &config.websocket;
    if !ws.path.starts_with('/') {
        errors.push(ValidationError::new("websocket.path", "must start with '/'"));
    }
    let positive = [
        ("websocket.request_timeout_secs", ws.request_timeout_secs as usize),
        ("websocket.max_message_size", ws.max_message_size),
        ("websocket.outbound_queue", ws.outbound_queue),
        ("websocket.max_concurrent_dispatch", ws.max_concurrent_dispatch),
        ("websocket.max_pending_requests", ws.max_pending_requests),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    let mut seen = HashSet::new();
    for (i, credential) in config.auth.credentials.iter().enumerate() {
        if credential.account.is_empty() {
            errors.push(ValidationError::new(
                &format!("auth.credentials[{}].account", i),
                "must not be empty",
            ));
        }
        if credential.password.is_empty() {
            errors.push(ValidationError::new(
                &format!("auth.credentials[{}].password", i),
                "must not be empty",
            ));
        }
        if !seen.insert((credential.account.as_str(), credential.device_id)) {
            errors.push(ValidationError::new(
                &format!("auth.credentials[{}]", i),
                format!(
                    "duplicate credential for {}.{}",
                    credential.account, credential.device_id
                ),
            ));
        }
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {}", obs.metrics_address),
        ));
    }
    if obs.request_log_buffer == 0 {
        errors.push(ValidationError::new("observability.request_log_buffer", "must be > 0"));
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
    use crate::config::schema::CredentialConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.websocket.path = "v1/websocket".into();
        config.websocket.outbound_queue = 0;
        config.auth.credentials = vec![
            CredentialConfig {
                account: "alice".into(),
                device_id: 1,
                password: "a".into(),
            },
            CredentialConfig {
                account: "alice".into(),
                device_id: 1,
                password: "".into(),
            },
        ];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "websocket.path",
                "websocket.outbound_queue",
                "auth.credentials[1].password",
                "auth.credentials[1]",
            ]
        );
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = ServerConfig::default();
        config.observability.metrics_address = "bogus".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}

//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate URLs and value ranges
//! - Catch enabled features missing their required settings
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: BridgeConfig → Result<(), Vec<ValidationError>>
//! - Runs before the config is accepted into the system

use url::Url;

use crate::config::schema::BridgeConfig;

/// A single semantic defect in the configuration.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the full configuration, collecting every defect.
pub fn validate_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_url(&mut errors, "workflow.webhook_url", &config.workflow.webhook_url, &["http", "https"]);
    if let Some(ws) = &config.workflow.websocket_url {
        check_url(&mut errors, "workflow.websocket_url", ws, &["ws", "wss"]);
    }
    check_nonzero(
        &mut errors,
        "workflow.request_timeout_secs",
        config.workflow.request_timeout_secs,
    );
    check_nonzero(
        &mut errors,
        "workflow.reconnect_interval_secs",
        config.workflow.reconnect_interval_secs,
    );

    check_url(
        &mut errors,
        "transcription.websocket_url",
        &config.transcription.websocket_url,
        &["ws", "wss"],
    );
    check_url(
        &mut errors,
        "transcription.http_url",
        &config.transcription.http_url,
        &["http", "https"],
    );
    if config.transcription.sample_rate == 0 {
        push(&mut errors, "transcription.sample_rate", "must be positive");
    }

    if config.tts.enabled {
        check_url(&mut errors, "tts.api_url", &config.tts.api_url, &["http", "https"]);
        if config.tts.api_key.is_empty() {
            push(&mut errors, "tts.api_key", "required when tts is enabled");
        }
        if config.tts.voice_id.is_empty() {
            push(&mut errors, "tts.voice_id", "required when tts is enabled");
        }
    }

    if config.broker.enabled {
        check_url(
            &mut errors,
            "broker.websocket_url",
            &config.broker.websocket_url,
            &["ws", "wss"],
        );
    }

    if config.queue.max_items == 0 {
        push(&mut errors, "queue.max_items", "must be positive");
    }
    check_nonzero(
        &mut errors,
        "queue.process_interval_secs",
        config.queue.process_interval_secs,
    );
    check_nonzero(&mut errors, "queue.backoff_cap_secs", config.queue.backoff_cap_secs);
    check_nonzero(&mut errors, "queue.retention_days", config.queue.retention_days);

    if config.resilience.failure_threshold == 0 {
        push(&mut errors, "resilience.failure_threshold", "must be positive");
    }
    check_nonzero(
        &mut errors,
        "resilience.recovery_timeout_secs",
        config.resilience.recovery_timeout_secs,
    );

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        push(
            &mut errors,
            "observability.metrics_address",
            "not a valid socket address",
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &str, value: &str, schemes: &[&str]) {
    match Url::parse(value) {
        Ok(url) if schemes.contains(&url.scheme()) => {}
        Ok(url) => push(
            errors,
            field,
            &format!("scheme '{}' not allowed (expected one of {schemes:?})", url.scheme()),
        ),
        Err(e) => push(errors, field, &format!("invalid URL: {e}")),
    }
}

fn check_nonzero(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        push(errors, field, "must be positive");
    }
}

fn push(errors: &mut Vec<ValidationError>, field: &str, message: &str) {
    errors.push(ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    });
}

use std::fmt;

use crate::types::ModelName;

/// Errors raised by the webhook pipeline outside of HTTP delivery itself.
///
/// Delivery failures never surface here: they are recorded on the payload and
/// subscription instead (see [`FailureReason`]).
#[derive(Debug)]
pub enum WebhookError {
    /// Persistence layer failed.
    Storage(StorageError),

    /// Field or filter selector could not be parsed or validated.
    Selector(SelectorError),

    /// Configuration rejected at startup.
    Config(ConfigError),

    /// Model is not webhook-enabled.
    UnregisteredModel {
        model: ModelName,
    },

    /// A webhook was created without a signing secret.
    MissingSecret,

    /// Payload body is not valid JSON.
    InvalidPayload(String),

    /// Event type is neither `<Model>.<operation>` for a registered model
    /// nor an allowed custom event.
    InvalidEventType(String),

    /// Referenced record does not exist.
    NotFound {
        kind: &'static str,
        id: String,
    },
}

impl fmt::Display for WebhookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookError::Storage(err) =>
                write!(f, "storage error: {}", err),
            WebhookError::Selector(err) =>
                write!(f, "selector error: {}", err),
            WebhookError::Config(err) =>
                write!(f, "config error: {}", err),
            WebhookError::UnregisteredModel { model } =>
                write!(f, "unregistered model name: {}", model),
            WebhookError::MissingSecret =>
                write!(f, "webhook secret is required"),
            WebhookError::InvalidPayload(reason) =>
                write!(f, "payload must be valid JSON: {}", reason),
            WebhookError::InvalidEventType(event_type) =>
                write!(f, "invalid event type: {}", event_type),
            WebhookError::NotFound { kind, id } =>
                write!(f, "{} not found: {}", kind, id),
        }
    }
}

impl std::error::Error for WebhookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WebhookError::Storage(err) => Some(err),
            WebhookError::Selector(err) => Some(err),
            WebhookError::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for WebhookError {
    fn from(err: StorageError) -> Self {
        WebhookError::Storage(err)
    }
}

impl From<SelectorError> for WebhookError {
    fn from(err: SelectorError) -> Self {
        WebhookError::Selector(err)
    }
}

impl From<ConfigError> for WebhookError {
    fn from(err: ConfigError) -> Self {
        WebhookError::Config(err)
    }
}

/// Errors reported by a [`Storage`](crate::Storage) backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend I/O or query failure.
    Backend(String),

    /// Stored record could not be encoded or decoded.
    Serialization(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Backend(msg) =>
                write!(f, "backend failure: {}", msg),
            StorageError::Serialization(msg) =>
                write!(f, "serialization failure: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors produced while parsing field selections and filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// Field selection names no field.
    EmptySelection,

    /// Braces in a field selection do not balance.
    Unbalanced,

    /// Unexpected token in a field selection.
    UnexpectedToken(String),

    /// Filter expression has an unsupported shape.
    InvalidFilter(String),

    /// Selection or filter nests deeper than allowed.
    TooDeep {
        limit: usize,
    },

    /// Selector references a field the model does not have.
    UnknownField {
        model: ModelName,
        field: String,
    },
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::EmptySelection =>
                write!(f, "field selection is empty"),
            SelectorError::Unbalanced =>
                write!(f, "unbalanced braces in field selection"),
            SelectorError::UnexpectedToken(token) =>
                write!(f, "unexpected token in field selection: {}", token),
            SelectorError::InvalidFilter(reason) =>
                write!(f, "invalid filter: {}", reason),
            SelectorError::TooDeep { limit } =>
                write!(f, "nesting deeper than {} levels", limit),
            SelectorError::UnknownField { model, field } =>
                write!(f, "model {} has no field {}", model, field),
        }
    }
}

impl std::error::Error for SelectorError {}

/// Configuration values that cannot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroPackSize,
    ZeroThreshold,
    ZeroWorkers,
    ZeroQueueSize,
    ZeroTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroPackSize =>
                write!(f, "max_pack_size must be positive"),
            ConfigError::ZeroThreshold =>
                write!(f, "unavailability_threshold must be positive"),
            ConfigError::ZeroWorkers =>
                write!(f, "worker_count must be positive"),
            ConfigError::ZeroQueueSize =>
                write!(f, "queue_size must be positive"),
            ConfigError::ZeroTimeout =>
                write!(f, "request_timeout must be positive"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors returned when a sync task cannot be enqueued.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// Task queue is full.
    /// The periodic sweep picks the work up later.
    Backpressure,

    /// Syncer has been shut down.
    Shutdown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Backpressure =>
                write!(f, "sync queue at capacity"),
            DispatchError::Shutdown =>
                write!(f, "syncer is shut down"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Reasons why an HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No response within the request timeout.
    Timeout,

    /// Connection-level failure.
    Network(String),

    /// Endpoint answered with a non-2xx status.
    HttpStatus {
        code: u16,
        reason: Option<String>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timeout"),
            FailureReason::Network(msg) =>
                write!(f, "network error: {}", msg),
            FailureReason::HttpStatus { code, reason: Some(reason) } =>
                write!(f, "HTTP {}: {}", code, reason),
            FailureReason::HttpStatus { code, reason: None } =>
                write!(f, "HTTP {}", code),
        }
    }
}

/// Inbound request rejections raised by the API guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Raw request source exceeds the configured byte limit.
    PayloadTooLarge {
        size: usize,
        limit: usize,
    },

    /// Caller exhausted its request quota.
    TooManyRequests {
        identity: String,
    },
}

impl GuardError {
    /// Error code reported to the API caller.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::PayloadTooLarge { .. } => "TOO_LARGE_REQUESTS",
            GuardError::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::PayloadTooLarge { size, limit } =>
                write!(f, "request payload of {} bytes exceeds limit of {} bytes", size, limit),
            GuardError::TooManyRequests { identity } =>
                write!(f, "request quota exhausted for {}", identity),
        }
    }
}

impl std::error::Error for GuardError {}

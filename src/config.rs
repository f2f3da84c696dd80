use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of changes carried by one pack.
pub const DEFAULT_MAX_PACK_SIZE: usize = 100;

/// Consecutive failures after which a subscription is suspended.
pub const DEFAULT_UNAVAILABILITY_THRESHOLD: u32 = 10;

/// Default byte limit for inbound GraphQL source text.
pub const DEFAULT_PAYLOAD_LIMIT: usize = 1024 * 1024;

/// Default lifetime of a payload before it expires.
pub const DEFAULT_PAYLOAD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Tunables of the webhook pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_pack_size: usize,
    pub unavailability_threshold: u32,

    /// Lifetime of a payload; no attempts happen after it.
    pub payload_ttl: Duration,

    /// Upper bound of a single HTTP attempt.
    pub request_timeout: Duration,

    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,

    /// Delay between recovery probes of a suspended subscription.
    pub probe_interval: Duration,

    /// Stored response bodies are cut to this many characters.
    pub max_response_body_len: usize,

    pub worker_count: usize,
    pub queue_size: usize,

    /// Packs delivered per subscription before yielding the lane.
    pub max_packs_per_run: usize,

    /// Interval of the full re-scan of registered models; `None` disables it.
    pub sweep_interval: Option<Duration>,

    pub id_header: String,
    pub signature_header: String,

    /// Event types accepted for standalone payloads besides
    /// `<Model>.<operation>`.
    pub custom_event_types: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            unavailability_threshold: DEFAULT_UNAVAILABILITY_THRESHOLD,
            payload_ttl: DEFAULT_PAYLOAD_TTL,
            request_timeout: Duration::from_secs(30),
            retry_base_ms: 60_000,
            retry_max_ms: 60 * 60_000,
            retry_jitter_ms: 5_000,
            probe_interval: Duration::from_secs(30 * 60),
            max_response_body_len: 1_000,
            worker_count,
            queue_size: 1_000,
            max_packs_per_run: 100,
            sweep_interval: Some(Duration::from_secs(5 * 60)),
            id_header: "X-Webhook-Id".to_string(),
            signature_header: "X-Webhook-Signature".to_string(),
            custom_event_types: Vec::new(),
        }
    }
}

impl WebhookConfig {
    /// Reject values the pipeline cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pack_size == 0 {
            return Err(ConfigError::ZeroPackSize);
        }
        if self.unavailability_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn with_max_pack_size(mut self, max_pack_size: usize) -> Self {
        self.max_pack_size = max_pack_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        self.retry_base_ms = base_ms;
        self.retry_max_ms = max_ms;
        self.retry_jitter_ms = jitter_ms;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_custom_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.custom_event_types.push(event_type.into());
        self
    }

    pub(crate) fn payload_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.payload_ttl).unwrap_or_else(|_| chrono::Duration::days(7))
    }

    pub(crate) fn probe_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.probe_interval).unwrap_or_else(|_| chrono::Duration::minutes(30))
    }
}

//! Inbound request guards of the GraphQL API.
//!
//! Both checks run when the server has resolved the raw request source and
//! before anything is parsed, so a rejected request does no work at all.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DEFAULT_PAYLOAD_LIMIT;
use crate::error::GuardError;
use crate::telemetry::metric_inc;

/// Rejects request sources larger than a byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSizeGuard {
    limit: usize,
}

impl Default for PayloadSizeGuard {
    fn default() -> Self {
        Self { limit: DEFAULT_PAYLOAD_LIMIT }
    }
}

impl PayloadSizeGuard {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// A source of exactly `limit` bytes passes.
    pub fn check_payload_size(&self, source: &str) -> Result<(), GuardError> {
        let size = source.len();
        if size > self.limit {
            metric_inc("webhook.guard.too_large");
            return Err(GuardError::PayloadTooLarge { size, limit: self.limit });
        }
        Ok(())
    }
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub last_refill_age_ms: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let cap = capacity.max(1) as f64;
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Take `cost` tokens if that many are available.
    pub fn try_take(&mut self, cost: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill = elapsed * self.refill_per_sec;
        self.tokens = (self.tokens + refill).min(self.capacity);
        self.last_refill = now;

        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let age = Instant::now().duration_since(self.last_refill).as_millis() as u64;
        RateLimiterStats {
            capacity: self.capacity,
            tokens: self.tokens,
            refill_per_sec: self.refill_per_sec,
            last_refill_age_ms: age,
        }
    }
}

/// Per-identity request quota.
#[derive(Debug)]
pub struct RequestQuota {
    capacity: u32,
    refill_per_sec: u32,
    allowlist: HashSet<String>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RequestQuota {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity,
            refill_per_sec,
            allowlist: HashSet::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Identities that are never limited, e.g. internal services.
    pub fn with_allowed(mut self, identity: impl Into<String>) -> Self {
        self.allowlist.insert(identity.into());
        self
    }

    pub async fn try_consume(&self, identity: &str, cost: u32) -> Result<(), GuardError> {
        if self.allowlist.contains(identity) {
            return Ok(());
        }
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec));
        if bucket.try_take(cost) {
            Ok(())
        } else {
            metric_inc("webhook.guard.too_many_requests");
            tracing::debug!(identity, "request quota exhausted");
            Err(GuardError::TooManyRequests { identity: identity.to_string() })
        }
    }

    pub async fn stats(&self) -> HashMap<String, RateLimiterStats> {
        let buckets = self.buckets.lock().await;
        buckets
            .iter()
            .map(|(identity, bucket)| (identity.clone(), bucket.snapshot()))
            .collect()
    }
}

/// Size check plus optional quota, invoked once the source is resolved.
#[derive(Debug, Default)]
pub struct RequestGuard {
    size: PayloadSizeGuard,
    quota: Option<RequestQuota>,
}

impl RequestGuard {
    pub fn new(size: PayloadSizeGuard) -> Self {
        Self { size, quota: None }
    }

    pub fn with_quota(mut self, quota: RequestQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Size first: an oversized request never consumes quota.
    pub async fn did_resolve_source(&self, identity: &str, source: &str) -> Result<(), GuardError> {
        self.size.check_payload_size(source)?;
        if let Some(quota) = &self.quota {
            quota.try_consume(identity, 1).await?;
        }
        Ok(())
    }
}

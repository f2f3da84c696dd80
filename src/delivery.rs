//! HTTP delivery of packs and standalone payloads.
//!
//! The engine is the only writer of subscription cursors and of payloads
//! after creation. Every method takes the current time explicitly; callers
//! pass `Utc::now()`.
//!
//! Per subscription, a cycle either retries the open payload, builds and
//! sends the next pack, or does nothing. Cursor writes are compare-and-set
//! against the position the pack was built from, so a cycle that lost a race
//! never rewinds or double-counts progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::WebhookConfig;
use crate::error::{FailureReason, StorageError, WebhookError};
use crate::packer::{ChangePacker, Pack, PackedChange};
use crate::signing::build_delivery_headers;
use crate::storage::{CursorAdvance, Storage};
use crate::telemetry::{metric_inc, metric_inc_model};
use crate::transport::{OutboundRequest, Transport, TransportError, TransportResponse};
use crate::types::{
    ItemId, ModelName, PackCursor, PayloadId, PayloadStatus, SubscriptionId, Webhook, WebhookPayload,
    WebhookSubscription,
};

/// Error message stored on payloads that ran out of time.
pub const EXPIRED_MESSAGE: &str = "Payload expired after TTL";

/// Exponential backoff between attempts of one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            base_ms: config.retry_base_ms,
            max_ms: config.retry_max_ms,
            jitter_ms: config.retry_jitter_ms,
        }
    }

    /// `base * 2^(attempt - 1)`, capped at `max`. Jitter is not included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_ms.max(1);
        let max = self.max_ms.max(base);
        let pow = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let exp = base.saturating_mul(pow);
        Duration::from_millis(exp.min(max))
    }

    pub fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::from_millis(0);
        }
        Duration::from_millis(fastrand::u64(0..=self.jitter_ms))
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt) + self.jitter();
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

/// Why a cycle did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Missing,

    /// Subscription or its webhook is soft-deleted.
    Deleted,

    /// Failure threshold reached and no probe is due yet.
    Unavailable {
        failures: u32,
        next_probe_at: Option<DateTime<Utc>>,
    },

    /// Open payload is waiting for its retry time.
    Backoff {
        until: DateTime<Utc>,
    },

    /// Payload is already sent or expired.
    AlreadyFinal,

    /// Payload belongs to a subscription and is only sent by its cycle.
    OwnedBySubscription {
        subscription_id: SubscriptionId,
    },
}

/// Result of one delivery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending.
    Idle,
    Skipped(SkipReason),
    Delivered {
        payload_id: PayloadId,
        changes: usize,
    },
    Failed {
        payload_id: PayloadId,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    Expired {
        payload_id: PayloadId,
    },

    /// Delivered, but the cursor had already moved; nothing was advanced.
    Stale {
        payload_id: PayloadId,
    },
}

impl CycleOutcome {
    /// When the subscription or payload should be looked at again.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CycleOutcome::Failed { next_retry_at, .. } => Some(*next_retry_at),
            CycleOutcome::Skipped(SkipReason::Backoff { until }) => Some(*until),
            CycleOutcome::Skipped(SkipReason::Unavailable { next_probe_at, .. }) => *next_probe_at,
            _ => None,
        }
    }

    /// Whether more packs may be waiting right away.
    pub fn made_progress(&self) -> bool {
        matches!(self, CycleOutcome::Delivered { .. })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PackBody<'a> {
    id: &'a PayloadId,
    event_type: &'a str,
    model_name: &'a ModelName,
    item_id: Option<&'a ItemId>,
    subscription_id: &'a SubscriptionId,
    count: usize,
    data: &'a [PackedChange],
}

pub struct DeliveryEngine {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    packer: ChangePacker,
    retry: RetryPolicy,
    config: WebhookConfig,
}

impl DeliveryEngine {
    pub fn new(config: WebhookConfig, storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            packer: ChangePacker::new(config.max_pack_size),
            retry: RetryPolicy::from_config(&config),
            storage,
            transport,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn packer(&self) -> &ChangePacker {
        &self.packer
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// One delivery cycle for a subscription. Sends at most one payload.
    pub async fn run_cycle(
        &self,
        subscription_id: &SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, WebhookError> {
        let Some(mut subscription) = self.storage.load_subscription(subscription_id).await? else {
            return Ok(CycleOutcome::Skipped(SkipReason::Missing));
        };
        if subscription.is_deleted() {
            return Ok(CycleOutcome::Skipped(SkipReason::Deleted));
        }
        let webhook = match self.storage.load_webhook(&subscription.webhook_id).await? {
            Some(webhook) if !webhook.is_deleted() => webhook,
            _ => return Ok(CycleOutcome::Skipped(SkipReason::Deleted)),
        };

        let threshold = self.config.unavailability_threshold;
        let probing = subscription.is_unavailable(threshold);
        if probing {
            if !subscription.probe_due(now) {
                tracing::debug!(
                    subscription = %subscription.id,
                    failures = subscription.failures_count,
                    "subscription unavailable, skipping delivery"
                );
                metric_inc_model("webhook.subscription.skipped", &subscription.model);
                return Ok(CycleOutcome::Skipped(SkipReason::Unavailable {
                    failures: subscription.failures_count,
                    next_probe_at: subscription.next_probe_at,
                }));
            }
            tracing::info!(
                subscription = %subscription.id,
                failures = subscription.failures_count,
                "probing unavailable subscription"
            );
            metric_inc("webhook.subscription.probe");
        }

        if let Some(mut payload) = self.storage.open_payload(&subscription.id).await? {
            if now > payload.expires_at {
                self.expire(&mut payload).await?;
                return Ok(CycleOutcome::Expired { payload_id: payload.id });
            }
            // Probes ignore backoff.
            if !probing && now < payload.next_retry_at {
                return Ok(CycleOutcome::Skipped(SkipReason::Backoff {
                    until: payload.next_retry_at,
                }));
            }
            return self.attempt(&mut payload, now).await;
        }

        for _ in 0..self.config.max_packs_per_run.max(1) {
            let Some(pack) = self.packer.next_pack(self.storage.as_ref(), &subscription).await? else {
                return Ok(CycleOutcome::Idle);
            };

            if pack.is_cursor_only() {
                let advance = CursorAdvance {
                    through: pack.through.clone(),
                    delivered: 0,
                    reset_failures: false,
                };
                if !self.storage.compare_and_advance(&subscription.id, &pack.from, &advance).await? {
                    tracing::warn!(subscription = %subscription.id, "cursor moved concurrently, skipping");
                    return Ok(CycleOutcome::Idle);
                }
                tracing::debug!(
                    subscription = %subscription.id,
                    through = %pack.through.changed_at,
                    "cursor advanced past filtered changes"
                );
                subscription.synced_at = pack.through.changed_at;
                subscription.synced_key = Some(pack.through);
                continue;
            }

            let mut payload = self.create_pack_payload(&subscription, &webhook, &pack, now)?;
            self.storage.insert_payload(&payload).await?;
            tracing::debug!(
                subscription = %subscription.id,
                payload = %payload.id,
                changes = pack.len(),
                "pack payload created"
            );
            return self.attempt(&mut payload, now).await;
        }

        Ok(CycleOutcome::Idle)
    }

    /// Deliver a standalone payload by id.
    ///
    /// Subscription payloads are left to [`DeliveryEngine::run_cycle`] on the
    /// subscription's lane, so they are reported as skipped here.
    pub async fn deliver_payload(
        &self,
        payload_id: &PayloadId,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, WebhookError> {
        let Some(mut payload) = self.storage.load_payload(payload_id).await? else {
            return Ok(CycleOutcome::Skipped(SkipReason::Missing));
        };
        if let Some(subscription_id) = payload.subscription_id.clone() {
            return Ok(CycleOutcome::Skipped(SkipReason::OwnedBySubscription { subscription_id }));
        }
        if payload.status.is_terminal() {
            return Ok(CycleOutcome::Skipped(SkipReason::AlreadyFinal));
        }
        if now > payload.expires_at {
            self.expire(&mut payload).await?;
            return Ok(CycleOutcome::Expired { payload_id: payload.id });
        }
        if now < payload.next_retry_at {
            return Ok(CycleOutcome::Skipped(SkipReason::Backoff {
                until: payload.next_retry_at,
            }));
        }
        self.attempt(&mut payload, now).await
    }

    /// Build the payload record for a pack. Nothing is stored.
    pub fn create_pack_payload(
        &self,
        subscription: &WebhookSubscription,
        webhook: &Webhook,
        pack: &Pack,
        now: DateTime<Utc>,
    ) -> Result<WebhookPayload, WebhookError> {
        let id = PayloadId::generate();
        let event_type = pack
            .event_type()
            .unwrap_or_else(|| format!("{}.updated", pack.model));
        let item_id = pack.last_change().map(|change| change.id.clone());

        let body = PackBody {
            id: &id,
            event_type: &event_type,
            model_name: &pack.model,
            item_id: item_id.as_ref(),
            subscription_id: &subscription.id,
            count: pack.len(),
            data: &pack.changes,
        };
        let body = serde_json::to_string(&body).map_err(StorageError::from)?;

        Ok(WebhookPayload {
            id,
            payload: body,
            url: subscription.url.clone().unwrap_or_else(|| webhook.url.clone()),
            secret: subscription.secret.clone().unwrap_or_else(|| webhook.secret.clone()),
            event_type,
            model_name: pack.model.clone(),
            item_id,
            subscription_id: Some(subscription.id.clone()),
            status: PayloadStatus::Pending,
            attempt: 0,
            last_http_status_code: None,
            last_response_body: None,
            last_error_message: None,
            expires_at: now + self.config.payload_ttl_chrono(),
            next_retry_at: now,
            last_sent_at: None,
            created_at: now,
            change_count: pack.len(),
            cursor: Some(PackCursor {
                from: pack.from.clone(),
                through: pack.through.clone(),
            }),
        })
    }

    /// Clear the failure counter of a suspended subscription.
    pub async fn reactivate(&self, subscription_id: &SubscriptionId) -> Result<bool, WebhookError> {
        let reset = self.storage.reset_failures(subscription_id).await?;
        if reset {
            tracing::info!(subscription = %subscription_id, "subscription reactivated");
        }
        Ok(reset)
    }

    /// One HTTP try of `payload`, with all state written back.
    pub async fn attempt(
        &self,
        payload: &mut WebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, WebhookError> {
        let request = OutboundRequest {
            url: payload.url.clone(),
            headers: build_delivery_headers(payload, &self.config),
            body: payload.payload.clone().into_bytes(),
            timeout: self.config.request_timeout,
            // Stored bodies are cut to characters, which take up to four bytes.
            max_response_bytes: self.config.max_response_body_len.saturating_mul(4),
        };

        let result = match tokio::time::timeout(self.config.request_timeout, self.transport.post(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        payload.attempt = payload.attempt.saturating_add(1);
        payload.last_sent_at = Some(now);

        match result {
            Ok(response) if response.is_success() => self.on_success(payload, response).await,
            Ok(response) => {
                let reason = FailureReason::HttpStatus {
                    code: response.status,
                    reason: response.reason.clone(),
                };
                payload.last_http_status_code = Some(response.status);
                payload.last_response_body = Some(self.truncate(&response.body));
                self.on_failure(payload, reason, now).await
            }
            Err(err) => {
                let reason = match err {
                    TransportError::Timeout => FailureReason::Timeout,
                    TransportError::Network(msg) => FailureReason::Network(msg),
                };
                payload.last_http_status_code = None;
                payload.last_response_body = None;
                self.on_failure(payload, reason, now).await
            }
        }
    }

    async fn on_success(
        &self,
        payload: &mut WebhookPayload,
        response: TransportResponse,
    ) -> Result<CycleOutcome, WebhookError> {
        payload.status = PayloadStatus::Sent;
        payload.last_http_status_code = Some(response.status);
        payload.last_response_body = Some(self.truncate(&response.body));
        payload.last_error_message = None;
        self.storage.update_payload(payload).await?;
        metric_inc("webhook.delivery.success");

        let Some(subscription_id) = payload.subscription_id.clone() else {
            tracing::info!(payload = %payload.id, event_type = %payload.event_type, "payload delivered");
            return Ok(CycleOutcome::Delivered {
                payload_id: payload.id.clone(),
                changes: payload.change_count,
            });
        };

        let Some(cursor) = payload.cursor.clone() else {
            self.storage.reset_failures(&subscription_id).await?;
            return Ok(CycleOutcome::Delivered {
                payload_id: payload.id.clone(),
                changes: payload.change_count,
            });
        };

        let advance = CursorAdvance {
            through: cursor.through,
            delivered: payload.change_count,
            reset_failures: true,
        };
        if !self.storage.compare_and_advance(&subscription_id, &cursor.from, &advance).await? {
            tracing::warn!(
                subscription = %subscription_id,
                payload = %payload.id,
                "cursor moved before delivery completed, not advancing"
            );
            metric_inc("webhook.delivery.stale");
            self.storage.reset_failures(&subscription_id).await?;
            return Ok(CycleOutcome::Stale { payload_id: payload.id.clone() });
        }

        tracing::info!(
            subscription = %subscription_id,
            payload = %payload.id,
            changes = payload.change_count,
            attempt = payload.attempt,
            "pack delivered"
        );
        Ok(CycleOutcome::Delivered {
            payload_id: payload.id.clone(),
            changes: payload.change_count,
        })
    }

    async fn on_failure(
        &self,
        payload: &mut WebhookPayload,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, WebhookError> {
        payload.last_error_message = Some(reason.to_string());

        let next_retry_at = self.retry.next_retry_at(now, payload.attempt);
        let expired = next_retry_at > payload.expires_at;
        if expired {
            payload.status = PayloadStatus::Expired;
        } else {
            payload.status = PayloadStatus::Failed;
            payload.next_retry_at = next_retry_at;
        }
        self.storage.update_payload(payload).await?;
        metric_inc("webhook.delivery.failure");

        tracing::warn!(
            payload = %payload.id,
            url = %payload.url,
            attempt = payload.attempt,
            error = %reason,
            expired,
            "delivery attempt failed"
        );

        if let Some(subscription_id) = &payload.subscription_id {
            let threshold = self.config.unavailability_threshold;
            let next_probe_at = now + self.config.probe_interval_chrono();
            let failures = self
                .storage
                .record_failure(subscription_id, threshold, next_probe_at)
                .await?;
            if failures == threshold {
                tracing::warn!(
                    subscription = %subscription_id,
                    failures,
                    next_probe_at = %next_probe_at,
                    "subscription marked unavailable"
                );
                metric_inc_model("webhook.subscription.unavailable", &payload.model_name);
            }
        }

        if expired {
            metric_inc("webhook.payload.expired");
            Ok(CycleOutcome::Expired { payload_id: payload.id.clone() })
        } else {
            Ok(CycleOutcome::Failed {
                payload_id: payload.id.clone(),
                attempt: payload.attempt,
                next_retry_at,
            })
        }
    }

    async fn expire(&self, payload: &mut WebhookPayload) -> Result<(), WebhookError> {
        payload.status = PayloadStatus::Expired;
        payload.last_error_message = Some(EXPIRED_MESSAGE.to_string());
        self.storage.update_payload(payload).await?;
        tracing::info!(payload = %payload.id, attempt = payload.attempt, "payload expired");
        metric_inc("webhook.payload.expired");
        Ok(())
    }

    fn truncate(&self, body: &str) -> String {
        body.chars().take(self.config.max_response_body_len).collect()
    }
}

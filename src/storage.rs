use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{
    ChangeKey, ChangeRecord, ModelName, NewChange, PayloadId, SubscriptionId, SyncPosition,
    Webhook, WebhookId, WebhookPayload, WebhookSubscription,
};

/// Cursor movement applied after a pack has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorAdvance {
    /// Last change covered; becomes the new position.
    pub through: ChangeKey,

    /// Changes delivered, added to `synced_amount`.
    pub delivered: usize,

    /// Clear `failures_count` and the probe schedule.
    pub reset_failures: bool,
}

/// Editable subscription settings. `None` leaves a value untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub url: Option<Option<String>>,
    pub fields: Option<Option<String>>,
    pub filters: Option<serde_json::Value>,
    pub operations: Option<crate::types::Operations>,
    pub max_pack_size: Option<Option<usize>>,
}

impl SubscriptionPatch {
    pub fn apply(&self, subscription: &mut WebhookSubscription) {
        if let Some(url) = &self.url {
            subscription.url = url.clone();
        }
        if let Some(fields) = &self.fields {
            subscription.fields = fields.clone();
        }
        if let Some(filters) = &self.filters {
            subscription.filters = filters.clone();
        }
        if let Some(operations) = self.operations {
            subscription.operations = operations;
        }
        if let Some(max_pack_size) = self.max_pack_size {
            subscription.max_pack_size = max_pack_size;
        }
    }
}

/// Persistence of webhooks, subscriptions, the change log and payloads.
///
/// Cursor writes go through [`Storage::compare_and_advance`] so that a
/// delivery never overwrites progress made by somebody else.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StorageError>;
    async fn load_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, StorageError>;
    async fn soft_delete_webhook(&self, id: &WebhookId, at: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> Result<(), StorageError>;
    async fn load_subscription(&self, id: &SubscriptionId) -> Result<Option<WebhookSubscription>, StorageError>;

    /// Subscriptions of `model` that are not deleted and whose webhook is
    /// not deleted.
    async fn active_subscriptions(&self, model: &ModelName) -> Result<Vec<WebhookSubscription>, StorageError>;

    async fn update_subscription(
        &self,
        id: &SubscriptionId,
        patch: &SubscriptionPatch,
    ) -> Result<Option<WebhookSubscription>, StorageError>;

    async fn soft_delete_subscription(&self, id: &SubscriptionId, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Move the cursor only if it still equals `expected`.
    async fn compare_and_advance(
        &self,
        id: &SubscriptionId,
        expected: &SyncPosition,
        advance: &CursorAdvance,
    ) -> Result<bool, StorageError>;

    /// Count one failed attempt. Once the count reaches `threshold` the next
    /// probe is scheduled at `next_probe_at`. Returns the new count.
    async fn record_failure(
        &self,
        id: &SubscriptionId,
        threshold: u32,
        next_probe_at: DateTime<Utc>,
    ) -> Result<u32, StorageError>;

    /// Clear failures and the probe schedule.
    async fn reset_failures(&self, id: &SubscriptionId) -> Result<bool, StorageError>;

    /// Append to the change log, assigning the next sequence number.
    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord, StorageError>;

    /// Changes of `model` strictly after `position`, in delivery order.
    async fn changes_after(
        &self,
        model: &ModelName,
        position: &SyncPosition,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError>;

    async fn insert_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError>;
    async fn update_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError>;
    async fn load_payload(&self, id: &PayloadId) -> Result<Option<WebhookPayload>, StorageError>;

    /// Oldest pending or failed payload of a subscription.
    async fn open_payload(&self, subscription_id: &SubscriptionId) -> Result<Option<WebhookPayload>, StorageError>;

    async fn payloads_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<WebhookPayload>, StorageError>;

    /// Standalone payloads that are still open, for restart recovery.
    async fn open_standalone_payloads(&self) -> Result<Vec<WebhookPayload>, StorageError>;
}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    webhooks: Mutex<HashMap<WebhookId, Webhook>>,
    subscriptions: Mutex<HashMap<SubscriptionId, WebhookSubscription>>,
    changes: Mutex<Vec<ChangeRecord>>,
    payloads: Mutex<Vec<WebhookPayload>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload ever created, in creation order.
    pub async fn payloads(&self) -> Vec<WebhookPayload> {
        self.payloads.lock().await.clone()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StorageError> {
        self.webhooks.lock().await.insert(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    async fn load_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, StorageError> {
        Ok(self.webhooks.lock().await.get(id).cloned())
    }

    async fn soft_delete_webhook(&self, id: &WebhookId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut guard = self.webhooks.lock().await;
        match guard.get_mut(id) {
            Some(webhook) if webhook.deleted_at.is_none() => {
                webhook.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> Result<(), StorageError> {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn load_subscription(&self, id: &SubscriptionId) -> Result<Option<WebhookSubscription>, StorageError> {
        Ok(self.subscriptions.lock().await.get(id).cloned())
    }

    async fn active_subscriptions(&self, model: &ModelName) -> Result<Vec<WebhookSubscription>, StorageError> {
        let webhooks = self.webhooks.lock().await;
        let subscriptions = self.subscriptions.lock().await;
        let mut active: Vec<WebhookSubscription> = subscriptions
            .values()
            .filter(|s| &s.model == model && !s.is_deleted())
            .filter(|s| webhooks.get(&s.webhook_id).map(|w| !w.is_deleted()).unwrap_or(false))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn update_subscription(
        &self,
        id: &SubscriptionId,
        patch: &SubscriptionPatch,
    ) -> Result<Option<WebhookSubscription>, StorageError> {
        let mut guard = self.subscriptions.lock().await;
        Ok(guard.get_mut(id).map(|subscription| {
            patch.apply(subscription);
            subscription.clone()
        }))
    }

    async fn soft_delete_subscription(&self, id: &SubscriptionId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut guard = self.subscriptions.lock().await;
        match guard.get_mut(id) {
            Some(subscription) if subscription.deleted_at.is_none() => {
                subscription.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_advance(
        &self,
        id: &SubscriptionId,
        expected: &SyncPosition,
        advance: &CursorAdvance,
    ) -> Result<bool, StorageError> {
        let mut guard = self.subscriptions.lock().await;
        let Some(subscription) = guard.get_mut(id) else {
            return Ok(false);
        };
        if &subscription.position() != expected || !expected.precedes(&advance.through) {
            return Ok(false);
        }

        subscription.synced_at = advance.through.changed_at;
        subscription.synced_key = Some(advance.through.clone());
        subscription.synced_amount += advance.delivered as u64;
        if advance.reset_failures {
            subscription.failures_count = 0;
            subscription.next_probe_at = None;
        }
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: &SubscriptionId,
        threshold: u32,
        next_probe_at: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let mut guard = self.subscriptions.lock().await;
        let Some(subscription) = guard.get_mut(id) else {
            return Ok(0);
        };
        subscription.failures_count = subscription.failures_count.saturating_add(1);
        if subscription.failures_count >= threshold {
            subscription.next_probe_at = Some(next_probe_at);
        }
        Ok(subscription.failures_count)
    }

    async fn reset_failures(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let mut guard = self.subscriptions.lock().await;
        let Some(subscription) = guard.get_mut(id) else {
            return Ok(false);
        };
        subscription.failures_count = 0;
        subscription.next_probe_at = None;
        Ok(true)
    }

    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord, StorageError> {
        let mut guard = self.changes.lock().await;
        let seq = guard.len() as u64 + 1;
        let record = change.at_log_precision().into_record(seq);
        guard.push(record.clone());
        Ok(record)
    }

    async fn changes_after(
        &self,
        model: &ModelName,
        position: &SyncPosition,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let guard = self.changes.lock().await;
        let mut pending: Vec<ChangeRecord> = guard
            .iter()
            .filter(|c| &c.model == model && position.precedes(&c.key()))
            .cloned()
            .collect();
        pending.sort_by_key(ChangeRecord::key);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn insert_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError> {
        self.payloads.lock().await.push(payload.clone());
        Ok(())
    }

    async fn update_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError> {
        let mut guard = self.payloads.lock().await;
        match guard.iter_mut().find(|p| p.id == payload.id) {
            Some(existing) => {
                *existing = payload.clone();
                Ok(())
            }
            None => Err(StorageError::Backend(format!("payload {} does not exist", payload.id))),
        }
    }

    async fn load_payload(&self, id: &PayloadId) -> Result<Option<WebhookPayload>, StorageError> {
        Ok(self.payloads.lock().await.iter().find(|p| &p.id == id).cloned())
    }

    async fn open_payload(&self, subscription_id: &SubscriptionId) -> Result<Option<WebhookPayload>, StorageError> {
        let guard = self.payloads.lock().await;
        Ok(guard
            .iter()
            .find(|p| p.subscription_id.as_ref() == Some(subscription_id) && p.is_open())
            .cloned())
    }

    async fn payloads_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<WebhookPayload>, StorageError> {
        let guard = self.payloads.lock().await;
        Ok(guard
            .iter()
            .filter(|p| p.subscription_id.as_ref() == Some(subscription_id))
            .cloned()
            .collect())
    }

    async fn open_standalone_payloads(&self) -> Result<Vec<WebhookPayload>, StorageError> {
        let guard = self.payloads.lock().await;
        Ok(guard
            .iter()
            .filter(|p| p.subscription_id.is_none() && p.is_open())
            .cloned()
            .collect())
    }
}

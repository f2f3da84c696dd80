use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::Client;

use crate::error::StorageError;
use crate::storage::{CursorAdvance, Storage, SubscriptionPatch};
use crate::types::{
    ChangeRecord, ModelName, NewChange, PayloadId, PayloadStatus, SubscriptionId, SyncPosition, Webhook, WebhookId,
    WebhookPayload, WebhookSubscription, CHANGE_TIME_PRECISION,
};

// Read-modify-write rounds before a contended subscription update gives up.
const MAX_CAS_ROUNDS: usize = 8;

/// Storage on PostgreSQL.
///
/// Records are JSONB documents next to the columns queries filter on.
/// Subscription writes compare the stored document, which makes every
/// cursor move a single conditional `UPDATE`.
pub struct PostgresStorage {
    client: Client,
}

impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_webhooks (
                    id TEXT PRIMARY KEY,
                    deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id TEXT PRIMARY KEY,
                    webhook_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_changes (
                    seq BIGSERIAL PRIMARY KEY,
                    model TEXT NOT NULL,
                    changed_at TIMESTAMPTZ NOT NULL,
                    item_id TEXT COLLATE \"C\" NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_changes_order
                 ON webhook_changes (model, changed_at, item_id, seq)",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_payloads (
                    id TEXT PRIMARY KEY,
                    subscription_id TEXT,
                    status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    async fn load_document<T: DeserializeOwned>(
        &self,
        query: &str,
        id: &str,
    ) -> Result<Option<(Value, T)>, StorageError> {
        let row = self.client.query_opt(query, &[&id]).await.map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Value = row.try_get(0).map_err(backend)?;
        let decoded = serde_json::from_value(raw.clone())?;
        Ok(Some((raw, decoded)))
    }

    /// Apply `change` to a subscription with optimistic retries. `change`
    /// returns `false` to abort without writing.
    async fn modify_subscription<F>(
        &self,
        id: &SubscriptionId,
        mut change: F,
    ) -> Result<Option<WebhookSubscription>, StorageError>
    where
        F: FnMut(&mut WebhookSubscription) -> bool + Send,
    {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some((raw, mut subscription)) = self
                .load_document::<WebhookSubscription>(
                    "SELECT payload FROM webhook_subscriptions WHERE id = $1",
                    id.as_str(),
                )
                .await?
            else {
                return Ok(None);
            };

            if !change(&mut subscription) {
                return Ok(None);
            }

            let updated = self
                .client
                .execute(
                    "UPDATE webhook_subscriptions
                     SET payload = $3, deleted = $4
                     WHERE id = $1 AND payload = $2",
                    &[&id.as_str(), &raw, &to_json(&subscription)?, &subscription.is_deleted()],
                )
                .await
                .map_err(backend)?;
            if updated == 1 {
                return Ok(Some(subscription));
            }
        }

        Err(StorageError::Backend(format!("subscription {} is contended", id)))
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO webhook_webhooks (id, deleted, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE SET deleted = EXCLUDED.deleted, payload = EXCLUDED.payload",
                &[&webhook.id.as_str(), &webhook.is_deleted(), &to_json(webhook)?],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, StorageError> {
        Ok(self
            .load_document("SELECT payload FROM webhook_webhooks WHERE id = $1", id.as_str())
            .await?
            .map(|(_, webhook)| webhook))
    }

    async fn soft_delete_webhook(&self, id: &WebhookId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let Some(mut webhook) = self.load_webhook(id).await? else {
            return Ok(false);
        };
        if webhook.is_deleted() {
            return Ok(false);
        }
        webhook.deleted_at = Some(at);
        let updated = self
            .client
            .execute(
                "UPDATE webhook_webhooks SET deleted = TRUE, payload = $2 WHERE id = $1 AND NOT deleted",
                &[&id.as_str(), &to_json(&webhook)?],
            )
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO webhook_subscriptions (id, webhook_id, model, deleted, payload)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET deleted = EXCLUDED.deleted, payload = EXCLUDED.payload",
                &[
                    &subscription.id.as_str(),
                    &subscription.webhook_id.as_str(),
                    &subscription.model.as_str(),
                    &subscription.is_deleted(),
                    &to_json(subscription)?,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_subscription(&self, id: &SubscriptionId) -> Result<Option<WebhookSubscription>, StorageError> {
        Ok(self
            .load_document("SELECT payload FROM webhook_subscriptions WHERE id = $1", id.as_str())
            .await?
            .map(|(_, subscription)| subscription))
    }

    async fn active_subscriptions(&self, model: &ModelName) -> Result<Vec<WebhookSubscription>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT s.payload
                 FROM webhook_subscriptions s
                 JOIN webhook_webhooks w ON w.id = s.webhook_id
                 WHERE s.model = $1 AND NOT s.deleted AND NOT w.deleted",
                &[&model.as_str()],
            )
            .await
            .map_err(backend)?;

        let mut active = decode_rows::<WebhookSubscription>(rows)?;
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn update_subscription(
        &self,
        id: &SubscriptionId,
        patch: &SubscriptionPatch,
    ) -> Result<Option<WebhookSubscription>, StorageError> {
        self.modify_subscription(id, |subscription| {
            patch.apply(subscription);
            true
        })
        .await
    }

    async fn soft_delete_subscription(&self, id: &SubscriptionId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let deleted = self
            .modify_subscription(id, |subscription| {
                if subscription.is_deleted() {
                    return false;
                }
                subscription.deleted_at = Some(at);
                true
            })
            .await?;
        Ok(deleted.is_some())
    }

    async fn compare_and_advance(
        &self,
        id: &SubscriptionId,
        expected: &SyncPosition,
        advance: &CursorAdvance,
    ) -> Result<bool, StorageError> {
        let advanced = self
            .modify_subscription(id, |subscription| {
                if &subscription.position() != expected || !expected.precedes(&advance.through) {
                    return false;
                }
                subscription.synced_at = advance.through.changed_at;
                subscription.synced_key = Some(advance.through.clone());
                subscription.synced_amount += advance.delivered as u64;
                if advance.reset_failures {
                    subscription.failures_count = 0;
                    subscription.next_probe_at = None;
                }
                true
            })
            .await?;
        Ok(advanced.is_some())
    }

    async fn record_failure(
        &self,
        id: &SubscriptionId,
        threshold: u32,
        next_probe_at: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let updated = self
            .modify_subscription(id, |subscription| {
                subscription.failures_count = subscription.failures_count.saturating_add(1);
                if subscription.failures_count >= threshold {
                    subscription.next_probe_at = Some(next_probe_at);
                }
                true
            })
            .await?;
        Ok(updated.map(|subscription| subscription.failures_count).unwrap_or(0))
    }

    async fn reset_failures(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let updated = self
            .modify_subscription(id, |subscription| {
                subscription.failures_count = 0;
                subscription.next_probe_at = None;
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord, StorageError> {
        // Column and document must carry the same instant.
        let change = change.at_log_precision();
        let row = self
            .client
            .query_one(
                "INSERT INTO webhook_changes (model, changed_at, item_id, payload)
                 VALUES ($1, $2, $3, $4)
                 RETURNING seq",
                &[
                    &change.model.as_str(),
                    &change.changed_at,
                    &change.item_id.as_str(),
                    &to_json(&change)?,
                ],
            )
            .await
            .map_err(backend)?;
        let seq: i64 = row.try_get(0).map_err(backend)?;
        Ok(change.into_record(seq as u64))
    }

    async fn changes_after(
        &self,
        model: &ModelName,
        position: &SyncPosition,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let limit = limit as i64;
        let rows = match &position.key {
            Some(key) => {
                let seq = key.seq as i64;
                self.client
                    .query(
                        "SELECT seq, payload FROM webhook_changes
                         WHERE model = $1 AND (changed_at, item_id, seq) > ($2, $3, $4)
                         ORDER BY changed_at, item_id, seq
                         LIMIT $5",
                        &[&model.as_str(), &key.changed_at, &key.item_id.as_str(), &seq, &limit],
                    )
                    .await
            }
            None => {
                let synced_at = position.synced_at.trunc_subsecs(CHANGE_TIME_PRECISION);
                self.client
                    .query(
                        "SELECT seq, payload FROM webhook_changes
                         WHERE model = $1 AND changed_at > $2
                         ORDER BY changed_at, item_id, seq
                         LIMIT $3",
                        &[&model.as_str(), &synced_at, &limit],
                    )
                    .await
            }
        }
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.try_get(0).map_err(backend)?;
                let payload: Value = row.try_get(1).map_err(backend)?;
                let change: NewChange = serde_json::from_value(payload)?;
                Ok(change.into_record(seq as u64))
            })
            .collect()
    }

    async fn insert_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError> {
        let subscription_id = payload.subscription_id.as_ref().map(|id| id.as_str());
        self.client
            .execute(
                "INSERT INTO webhook_payloads (id, subscription_id, status, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &payload.id.as_str(),
                    &subscription_id,
                    &payload.status.as_str(),
                    &payload.created_at,
                    &to_json(payload)?,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_payload(&self, payload: &WebhookPayload) -> Result<(), StorageError> {
        let updated = self
            .client
            .execute(
                "UPDATE webhook_payloads SET status = $2, payload = $3 WHERE id = $1",
                &[&payload.id.as_str(), &payload.status.as_str(), &to_json(payload)?],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StorageError::Backend(format!("payload {} does not exist", payload.id)));
        }
        Ok(())
    }

    async fn load_payload(&self, id: &PayloadId) -> Result<Option<WebhookPayload>, StorageError> {
        Ok(self
            .load_document("SELECT payload FROM webhook_payloads WHERE id = $1", id.as_str())
            .await?
            .map(|(_, payload)| payload))
    }

    async fn open_payload(&self, subscription_id: &SubscriptionId) -> Result<Option<WebhookPayload>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_payloads
                 WHERE subscription_id = $1 AND status IN ($2, $3)
                 ORDER BY created_at, id
                 LIMIT 1",
                &[
                    &subscription_id.as_str(),
                    &PayloadStatus::Pending.as_str(),
                    &PayloadStatus::Failed.as_str(),
                ],
            )
            .await
            .map_err(backend)?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn payloads_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<WebhookPayload>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_payloads WHERE subscription_id = $1 ORDER BY created_at, id",
                &[&subscription_id.as_str()],
            )
            .await
            .map_err(backend)?;
        decode_rows(rows)
    }

    async fn open_standalone_payloads(&self) -> Result<Vec<WebhookPayload>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_payloads
                 WHERE subscription_id IS NULL AND status IN ($1, $2)
                 ORDER BY created_at, id",
                &[&PayloadStatus::Pending.as_str(), &PayloadStatus::Failed.as_str()],
            )
            .await
            .map_err(backend)?;
        decode_rows(rows)
    }
}

fn backend(err: tokio_postgres::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, StorageError> {
    Ok(serde_json::to_value(value)?)
}

fn decode_row<T: DeserializeOwned>(row: &tokio_postgres::Row) -> Result<T, StorageError> {
    let raw: Value = row.try_get(0).map_err(backend)?;
    Ok(serde_json::from_value(raw)?)
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<tokio_postgres::Row>) -> Result<Vec<T>, StorageError> {
    rows.iter().map(decode_row).collect()
}

//! Management operations on webhooks, subscriptions and standalone payloads.
//!
//! Everything that reaches storage through here has been validated against
//! the model registry, so the delivery side can assume well-formed selectors.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::WebhookConfig;
use crate::error::{ConfigError, WebhookError};
use crate::registry::ModelRegistry;
use crate::selector::normalize_fields_string;
use crate::storage::{Storage, SubscriptionPatch};
use crate::types::{
    ItemId, ModelName, PayloadId, SubscriptionId, Webhook, WebhookId, WebhookPayload, WebhookSubscription,
};

/// Input of a standalone payload.
#[derive(Debug, Clone)]
pub struct NewPayload {
    pub url: String,
    pub secret: String,
    pub event_type: String,
    pub model_name: ModelName,

    /// JSON body text.
    pub payload: String,
    pub item_id: Option<ItemId>,

    /// Defaults to the configured payload TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewPayload {
    pub fn new(
        url: impl Into<String>,
        secret: impl Into<String>,
        event_type: impl Into<String>,
        model_name: impl Into<ModelName>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            event_type: event_type.into(),
            model_name: model_name.into(),
            payload: payload.into(),
            item_id: None,
            expires_at: None,
        }
    }

    pub fn with_item_id(mut self, item_id: impl Into<ItemId>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    config: WebhookConfig,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn Storage>,
}

impl SubscriptionService {
    pub fn new(config: WebhookConfig, registry: Arc<ModelRegistry>, storage: Arc<dyn Storage>) -> Self {
        Self { config, registry, storage }
    }

    pub async fn create_webhook(&self, webhook: Webhook) -> Result<Webhook, WebhookError> {
        if webhook.secret.trim().is_empty() {
            return Err(WebhookError::MissingSecret);
        }
        self.storage.insert_webhook(&webhook).await?;
        tracing::info!(webhook = %webhook.id, name = %webhook.name, "webhook created");
        Ok(webhook)
    }

    /// Soft-delete a webhook. Its subscriptions stop being scheduled.
    pub async fn delete_webhook(&self, id: &WebhookId, at: DateTime<Utc>) -> Result<bool, WebhookError> {
        let deleted = self.storage.soft_delete_webhook(id, at).await?;
        if deleted {
            tracing::info!(webhook = %id, "webhook deleted");
        }
        Ok(deleted)
    }

    pub async fn create_subscription(
        &self,
        mut subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        match self.storage.load_webhook(&subscription.webhook_id).await? {
            Some(webhook) if !webhook.is_deleted() => {}
            _ => {
                return Err(WebhookError::NotFound {
                    kind: "webhook",
                    id: subscription.webhook_id.to_string(),
                })
            }
        }

        self.validate(&subscription.model, subscription.fields.as_deref(), &subscription.filters, subscription.max_pack_size)?;
        subscription.fields = subscription.fields.as_deref().map(normalize_fields_string);

        self.storage.insert_subscription(&subscription).await?;
        tracing::info!(
            subscription = %subscription.id,
            webhook = %subscription.webhook_id,
            model = %subscription.model,
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn update_subscription(
        &self,
        id: &SubscriptionId,
        mut patch: SubscriptionPatch,
    ) -> Result<WebhookSubscription, WebhookError> {
        let current = self.subscription(id).await?;

        let fields = match &patch.fields {
            Some(fields) => fields.as_deref(),
            None => current.fields.as_deref(),
        };
        let filters = patch.filters.as_ref().unwrap_or(&current.filters);
        let max_pack_size = patch.max_pack_size.unwrap_or(current.max_pack_size);
        self.validate(&current.model, fields, filters, max_pack_size)?;

        patch.fields = patch
            .fields
            .map(|fields| fields.map(|fields| normalize_fields_string(&fields)));

        self.storage
            .update_subscription(id, &patch)
            .await?
            .ok_or_else(|| not_found(id))
    }

    /// Soft-delete a subscription. No further cycles run for it.
    pub async fn delete_subscription(&self, id: &SubscriptionId, at: DateTime<Utc>) -> Result<bool, WebhookError> {
        let deleted = self.storage.soft_delete_subscription(id, at).await?;
        if deleted {
            tracing::info!(subscription = %id, "subscription deleted");
        }
        Ok(deleted)
    }

    /// Operator reset of a suspended subscription.
    pub async fn reactivate_subscription(&self, id: &SubscriptionId) -> Result<(), WebhookError> {
        if !self.storage.reset_failures(id).await? {
            return Err(not_found(id));
        }
        tracing::info!(subscription = %id, "subscription reactivated");
        Ok(())
    }

    pub async fn subscription(&self, id: &SubscriptionId) -> Result<WebhookSubscription, WebhookError> {
        self.storage
            .load_subscription(id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn payloads(&self, id: &SubscriptionId) -> Result<Vec<WebhookPayload>, WebhookError> {
        Ok(self.storage.payloads_for_subscription(id).await?)
    }

    /// Store a standalone payload. Delivery is requested separately.
    pub async fn create_payload(&self, input: NewPayload) -> Result<WebhookPayload, WebhookError> {
        if input.secret.trim().is_empty() {
            return Err(WebhookError::MissingSecret);
        }
        serde_json::from_str::<serde_json::Value>(&input.payload)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        self.registry
            .validate_event_type(&input.event_type, &self.config.custom_event_types)?;

        let mut payload = WebhookPayload::new(
            input.url,
            input.secret,
            input.event_type,
            input.model_name,
            input.payload,
            self.config.payload_ttl_chrono(),
        );
        payload.item_id = input.item_id;
        if let Some(expires_at) = input.expires_at {
            payload.expires_at = expires_at;
        }

        self.storage.insert_payload(&payload).await?;
        tracing::info!(payload = %payload.id, event_type = %payload.event_type, "payload created");
        Ok(payload)
    }

    pub async fn payload(&self, id: &PayloadId) -> Result<WebhookPayload, WebhookError> {
        self.storage
            .load_payload(id)
            .await?
            .ok_or_else(|| WebhookError::NotFound { kind: "payload", id: id.to_string() })
    }

    fn validate(
        &self,
        model: &ModelName,
        fields: Option<&str>,
        filters: &serde_json::Value,
        max_pack_size: Option<usize>,
    ) -> Result<(), WebhookError> {
        if !self.registry.is_registered(model) {
            return Err(WebhookError::UnregisteredModel { model: model.clone() });
        }
        if let Some(fields) = fields {
            self.registry.validate_fields(model, fields)?;
        }
        self.registry.validate_filters(model, filters)?;
        if max_pack_size == Some(0) {
            return Err(ConfigError::ZeroPackSize.into());
        }
        Ok(())
    }
}

fn not_found(id: &SubscriptionId) -> WebhookError {
    WebhookError::NotFound { kind: "subscription", id: id.to_string() }
}

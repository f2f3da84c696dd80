use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Name of a tracked data model, e.g. `User`.
    ModelName
);
string_id!(
    /// Identifier of an item of a tracked model.
    ItemId
);
string_id!(
    /// Identifier of a [`Webhook`].
    WebhookId
);
string_id!(
    /// Identifier of a [`WebhookSubscription`].
    SubscriptionId
);
string_id!(
    /// Identifier of a [`WebhookPayload`]. Sent as `X-Webhook-Id`.
    PayloadId
);

impl WebhookId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl PayloadId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Every operation a subscription can follow.
pub const WEBHOOK_OPERATIONS: [Operation; 3] = [Operation::Create, Operation::Update, Operation::Delete];

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Suffix used in event types: `User.created`.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Operation::Create => "created",
            Operation::Update => "updated",
            Operation::Delete => "deleted",
        }
    }

    pub fn from_past_tense(value: &str) -> Option<Self> {
        WEBHOOK_OPERATIONS.into_iter().find(|op| op.past_tense() == value)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which operations a subscription wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operations {
    pub create: bool,
    pub update: bool,
    pub delete: bool,
}

impl Default for Operations {
    fn default() -> Self {
        Self { create: true, update: true, delete: true }
    }
}

impl Operations {
    pub fn only(ops: &[Operation]) -> Self {
        Self {
            create: ops.contains(&Operation::Create),
            update: ops.contains(&Operation::Update),
            delete: ops.contains(&Operation::Delete),
        }
    }

    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Create => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }
}

/// External consumer of webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub name: String,
    pub description: Option<String>,

    /// Default delivery URL for subscriptions without their own.
    pub url: String,

    /// Owning user.
    pub user_id: String,

    /// HMAC signing key.
    pub secret: String,

    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        user_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: WebhookId::generate(),
            name: name.into(),
            description: None,
            url: url.into(),
            user_id: user_id.into(),
            secret: secret.into(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Position of a change in delivery order.
///
/// Ordering is by change time, then item id, then change-log sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeKey {
    pub changed_at: DateTime<Utc>,
    pub item_id: ItemId,
    pub seq: u64,
}

/// Watermark of a subscription: everything at or before it has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPosition {
    pub synced_at: DateTime<Utc>,

    /// Exact key of the last delivered change. `None` until the first
    /// advance, in which case only `synced_at` bounds the window.
    pub key: Option<ChangeKey>,
}

impl SyncPosition {
    pub fn starting_at(synced_at: DateTime<Utc>) -> Self {
        Self { synced_at, key: None }
    }

    /// Whether `key` lies strictly after this position.
    ///
    /// A bare start time is compared at change-log precision.
    pub fn precedes(&self, key: &ChangeKey) -> bool {
        match &self.key {
            Some(current) => key > current,
            None => key.changed_at > self.synced_at.trunc_subsecs(CHANGE_TIME_PRECISION),
        }
    }

    pub fn advanced_to(key: &ChangeKey) -> Self {
        Self {
            synced_at: key.changed_at,
            key: Some(key.clone()),
        }
    }
}

/// A committed mutation of a tracked model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Append order in the change log.
    pub seq: u64,
    pub model: ModelName,
    pub item_id: ItemId,
    pub operation: Operation,

    /// Item snapshot after the change; the last known snapshot for deletes.
    pub data: Value,
    pub changed_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            changed_at: self.changed_at,
            item_id: self.item_id.clone(),
            seq: self.seq,
        }
    }
}

/// A change before the log has assigned it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChange {
    pub model: ModelName,
    pub item_id: ItemId,
    pub operation: Operation,
    pub data: Value,
    pub changed_at: DateTime<Utc>,
}

/// Digits of sub-second precision kept in the change log.
///
/// Matches `TIMESTAMPTZ`, so log order and cursor order agree on every backend.
pub const CHANGE_TIME_PRECISION: u16 = 6;

impl NewChange {
    /// `changed_at` cut to what the change log can store.
    pub fn at_log_precision(mut self) -> Self {
        self.changed_at = self.changed_at.trunc_subsecs(CHANGE_TIME_PRECISION);
        self
    }

    pub fn into_record(self, seq: u64) -> ChangeRecord {
        ChangeRecord {
            seq,
            model: self.model,
            item_id: self.item_id,
            operation: self.operation,
            data: self.data,
            changed_at: self.changed_at,
        }
    }
}

/// One subscription of a webhook to a model's changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub webhook_id: WebhookId,

    /// Delivery endpoint. Falls back to the webhook URL when unset.
    pub url: Option<String>,

    pub model: ModelName,

    /// GraphQL-like field selection; `None` sends whole snapshots.
    pub fields: Option<String>,

    /// Where-input style filter; an empty object matches everything.
    pub filters: Value,

    pub operations: Operations,

    /// Pack size override; `None` uses the configured default.
    pub max_pack_size: Option<usize>,

    /// Signing key override; `None` uses the webhook secret.
    pub secret: Option<String>,

    pub synced_at: DateTime<Utc>,
    pub synced_key: Option<ChangeKey>,
    pub synced_amount: u64,
    pub failures_count: u32,

    /// Earliest time a suspended subscription may be probed.
    pub next_probe_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    /// New subscription that starts syncing changes made after now.
    pub fn new(webhook_id: WebhookId, model: impl Into<ModelName>) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::generate(),
            webhook_id,
            url: None,
            model: model.into(),
            fields: None,
            filters: Value::Object(Default::default()),
            operations: Operations::default(),
            max_pack_size: None,
            secret: None,
            synced_at: now,
            synced_key: None,
            synced_amount: 0,
            failures_count: 0,
            next_probe_at: None,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_operations(mut self, operations: Operations) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_max_pack_size(mut self, max_pack_size: usize) -> Self {
        self.max_pack_size = Some(max_pack_size);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Start the cursor at `synced_at` instead of the creation time.
    pub fn synced_from(mut self, synced_at: DateTime<Utc>) -> Self {
        self.synced_at = synced_at;
        self.synced_key = None;
        self
    }

    pub fn position(&self) -> SyncPosition {
        SyncPosition {
            synced_at: self.synced_at,
            key: self.synced_key.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_unavailable(&self, threshold: u32) -> bool {
        self.failures_count >= threshold
    }

    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        self.next_probe_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn pack_size(&self, default: usize) -> usize {
        self.max_pack_size.unwrap_or(default).max(1)
    }
}

/// Lifecycle of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadStatus {
    /// Created, not attempted yet.
    Pending,
    /// Delivered with a 2xx response.
    Sent,
    /// Last attempt failed; retried at `next_retry_at`.
    Failed,
    /// Past `expires_at`; no further attempts.
    Expired,
}

impl PayloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadStatus::Pending => "pending",
            PayloadStatus::Sent => "sent",
            PayloadStatus::Failed => "failed",
            PayloadStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PayloadStatus::Sent | PayloadStatus::Expired)
    }
}

/// Where a subscription pack came from and where it moves the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackCursor {
    /// Subscription position the pack was built from.
    pub from: SyncPosition,

    /// Key of the last change covered by the pack.
    pub through: ChangeKey,
}

/// Record of one delivery: the exact body, its target and every attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: PayloadId,

    /// JSON body, sent byte-for-byte.
    pub payload: String,
    pub url: String,
    pub secret: String,
    pub event_type: String,
    pub model_name: ModelName,
    pub item_id: Option<ItemId>,
    pub subscription_id: Option<SubscriptionId>,
    pub status: PayloadStatus,
    pub attempt: u32,
    pub last_http_status_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    /// Number of changes carried.
    pub change_count: usize,
    pub cursor: Option<PackCursor>,
}

impl WebhookPayload {
    /// Standalone payload not bound to a subscription.
    ///
    /// Defaults: status `pending`, attempt 0, retry eligible immediately,
    /// expiry after `ttl`.
    pub fn new(
        url: impl Into<String>,
        secret: impl Into<String>,
        event_type: impl Into<String>,
        model_name: impl Into<ModelName>,
        payload: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PayloadId::generate(),
            payload: payload.into(),
            url: url.into(),
            secret: secret.into(),
            event_type: event_type.into(),
            model_name: model_name.into(),
            item_id: None,
            subscription_id: None,
            status: PayloadStatus::Pending,
            attempt: 0,
            last_http_status_code: None,
            last_response_body: None,
            last_error_message: None,
            expires_at: now + ttl,
            next_retry_at: now,
            last_sent_at: None,
            created_at: now,
            change_count: 0,
            cursor: None,
        }
    }

    pub fn with_item_id(mut self, item_id: impl Into<ItemId>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

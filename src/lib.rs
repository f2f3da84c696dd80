//! Model-change webhooks.
//!
//! Tracks which data models are webhook-enabled, records committed changes
//! to them, packs each subscription's pending changes into ordered bounded
//! batches and delivers those as signed HTTP POSTs with retries.
//!
//! ## Guarantees
//! - Mutations never wait on delivery
//! - Per-subscription ordering: one in-flight delivery per subscription, the
//!   cursor only moves forward
//! - At-least-once delivery; receivers deduplicate by `X-Webhook-Id`
//! - Dead endpoints are suspended after a failure threshold and probed
//! - Every payload is kept as an audit record
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across subscriptions
//! - Delivery after a payload's expiry (its changes are re-packed instead)

mod config;
mod delivery;
mod error;
mod guard;
mod lock;
mod packer;
mod registry;
mod selector;
mod signing;
mod storage;
mod subscriptions;
mod syncer;
mod telemetry;
mod transport;
mod trigger;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod lock_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{
    WebhookConfig,
    DEFAULT_MAX_PACK_SIZE,
    DEFAULT_PAYLOAD_LIMIT,
    DEFAULT_PAYLOAD_TTL,
    DEFAULT_UNAVAILABILITY_THRESHOLD,
};
pub use delivery::{CycleOutcome, DeliveryEngine, RetryPolicy, SkipReason, EXPIRED_MESSAGE};
pub use error::{
    ConfigError,
    DispatchError,
    FailureReason,
    GuardError,
    SelectorError,
    StorageError,
    WebhookError,
};
pub use guard::{PayloadSizeGuard, RateLimiterStats, RequestGuard, RequestQuota, TokenBucket};
pub use lock::{LaneLock, LocalLaneLock, DEFAULT_LANE_TTL};
pub use packer::{ChangePacker, Pack, PackBuilder, PackedChange, DEFAULT_SCAN_BATCH};
pub use registry::{AfterChange, AfterChangeHook, HookChain, ModelRegistry, ModelSchema, OperationContext};
pub use selector::{normalize_fields_string, ChangeFilter, FieldSelector, FilterOp, MAX_NESTING_DEPTH};
pub use signing::{
    build_delivery_headers,
    compute_signature,
    parse_signature_headers,
    verify_signature,
    verify_webhook_request,
    ParsedSignature,
    VerificationError,
};
pub use storage::{CursorAdvance, InMemoryStorage, Storage, SubscriptionPatch};
pub use subscriptions::{NewPayload, SubscriptionService};
pub use syncer::WebhookSyncer;
pub use transport::{decode_capped, OutboundRequest, Transport, TransportError, TransportResponse};
pub use trigger::{ScheduleTrigger, SyncTask, TaskQueue};
pub use types::{
    ChangeKey,
    ChangeRecord,
    ItemId,
    ModelName,
    NewChange,
    Operation,
    Operations,
    PackCursor,
    PayloadId,
    PayloadStatus,
    SubscriptionId,
    SyncPosition,
    Webhook,
    WebhookId,
    WebhookPayload,
    WebhookSubscription,
    CHANGE_TIME_PRECISION,
    WEBHOOK_OPERATIONS,
};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "redis")]
pub use lock::RedisLaneLock;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{DispatchError, WebhookError};
use crate::registry::{AfterChange, AfterChangeHook, ModelRegistry};
use crate::storage::Storage;
use crate::telemetry::{metric_inc, metric_inc_model};
use crate::types::{ModelName, NewChange, PayloadId, SubscriptionId};

/// A unit of work consumed by workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTask {
    /// Fan out to every active subscription of a model.
    Model(ModelName),

    /// Run delivery cycles for one subscription.
    Subscription(SubscriptionId),

    /// Deliver one standalone payload.
    Payload(PayloadId),
}

impl SyncTask {
    /// Serialization lane of the task. Model fan-out needs none.
    pub fn lane(&self) -> Option<String> {
        match self {
            SyncTask::Model(_) => None,
            SyncTask::Subscription(id) => Some(format!("subscription:{}", id)),
            SyncTask::Payload(id) => Some(format!("payload:{}", id)),
        }
    }
}

/// Sending half of the bounded sync queue.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<SyncTask>,
}

impl TaskQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SyncTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, task: SyncTask) -> Result<(), DispatchError> {
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DispatchError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Shutdown,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// After-change hook that records the change and schedules delivery.
///
/// Never fails the mutation: errors are logged and counted. The only work
/// done inline is the change-log append and non-blocking enqueues.
pub struct ScheduleTrigger {
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn Storage>,
    queue: TaskQueue,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl ScheduleTrigger {
    pub const NAME: &'static str = "webhooks.scheduleSync";

    pub fn new(registry: Arc<ModelRegistry>, storage: Arc<dyn Storage>, queue: TaskQueue) -> Self {
        Self {
            registry,
            storage,
            queue,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Sync tasks enqueued so far.
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Sync tasks dropped on a full queue.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record `change` and enqueue one task per active subscription.
    /// Returns the number of tasks enqueued.
    pub async fn schedule(&self, change: &AfterChange) -> Result<usize, WebhookError> {
        if !self.registry.is_registered(&change.model) {
            return Ok(0);
        }
        let Some(item_id) = change.item_id() else {
            tracing::warn!(model = %change.model, operation = %change.operation, "change without item id ignored");
            return Ok(0);
        };

        let mut data = change.snapshot().cloned().unwrap_or(Value::Null);
        if let (Value::Object(fields), Some(derived)) = (&mut data, change.context.derived(&item_id)) {
            for (name, value) in derived {
                fields.insert(name.clone(), value.clone());
            }
        }

        let record = self
            .storage
            .append_change(NewChange {
                model: change.model.clone(),
                item_id,
                operation: change.operation,
                data,
                changed_at: change.at,
            })
            .await?;

        let subscriptions = self.storage.active_subscriptions(&change.model).await?;
        let mut enqueued = 0;
        for subscription in subscriptions {
            match self.queue.try_enqueue(SyncTask::Subscription(subscription.id.clone())) {
                Ok(()) => {
                    enqueued += 1;
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    metric_inc_model("webhook.trigger.enqueued", &change.model);
                }
                Err(DispatchError::Backpressure) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metric_inc("webhook.trigger.backpressure");
                    tracing::warn!(
                        subscription = %subscription.id,
                        model = %change.model,
                        "sync queue full, leaving subscription to the sweep"
                    );
                }
                Err(DispatchError::Shutdown) => {
                    tracing::debug!(model = %change.model, "syncer stopped, change recorded only");
                    break;
                }
            }
        }

        tracing::debug!(
            model = %record.model,
            item = %record.item_id,
            seq = record.seq,
            enqueued,
            "change recorded"
        );
        Ok(enqueued)
    }
}

#[async_trait]
impl AfterChangeHook for ScheduleTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn after_change(&self, change: &AfterChange) {
        if let Err(err) = self.schedule(change).await {
            metric_inc("webhook.trigger.error");
            tracing::error!(model = %change.model, error = %err, "failed to schedule webhook sync");
        }
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};

use crate::delivery::{CycleOutcome, DeliveryEngine};
use crate::error::DispatchError;
use crate::lock::LaneLock;
use crate::telemetry::metric_inc;
use crate::trigger::{SyncTask, TaskQueue};
use crate::types::{ModelName, PayloadId, SubscriptionId};

/// Result of one task, sent to the scheduler when it needs a timed re-run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub task: SyncTask,
    pub retry_at: DateTime<Utc>,
}

/// Shared context for all workers.
pub struct WorkerContext {
    pub engine: Arc<DeliveryEngine>,

    /// Per-lane mutual exclusion.
    pub lanes: Arc<dyn LaneLock>,

    /// Lanes that received work while another worker owned them.
    pub dirty: Mutex<HashSet<String>>,

    /// Re-enqueue path for fan-out and yielded lanes.
    pub queue: TaskQueue,

    /// Timed re-runs, handled by the scheduler.
    pub report_tx: mpsc::Sender<SyncReport>,
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls tasks from the shared queue
/// - Takes the task's lane or hands the work to its current owner
/// - Reports retry times to the scheduler instead of sleeping
pub async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<SyncTask>>>,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = {
            let mut guard = rx.lock().await;
            tokio::select! {
                task = guard.recv() => task,
                _ = shutdown.changed() => None,
            }
        };

        let Some(task) = task else { break };
        process_task(task, &ctx).await;
    }
}

async fn process_task(task: SyncTask, ctx: &WorkerContext) {
    let task = match task {
        SyncTask::Payload(id) => resolve_payload(id, ctx).await,
        other => other,
    };
    match &task {
        SyncTask::Model(model) => fan_out(model, ctx).await,
        SyncTask::Subscription(_) | SyncTask::Payload(_) => {
            if let Some(retry_at) = run_lane(&task, ctx).await {
                let _ = ctx.report_tx.send(SyncReport { task, retry_at }).await;
            }
        }
    }
}

/// Payloads that belong to a subscription run on the subscription's lane.
async fn resolve_payload(id: PayloadId, ctx: &WorkerContext) -> SyncTask {
    match ctx.engine.storage().load_payload(&id).await {
        Ok(Some(payload)) => match payload.subscription_id {
            Some(subscription_id) => SyncTask::Subscription(subscription_id),
            None => SyncTask::Payload(id),
        },
        Ok(None) => SyncTask::Payload(id),
        Err(err) => {
            tracing::warn!(payload = %id, error = %err, "failed to load payload");
            SyncTask::Payload(id)
        }
    }
}

async fn fan_out(model: &ModelName, ctx: &WorkerContext) {
    let subscriptions = match ctx.engine.storage().active_subscriptions(model).await {
        Ok(subscriptions) => subscriptions,
        Err(err) => {
            tracing::warn!(model = %model, error = %err, "failed to list subscriptions");
            return;
        }
    };

    for subscription in subscriptions {
        let task = SyncTask::Subscription(subscription.id);
        match ctx.queue.try_enqueue(task.clone()) {
            Ok(()) => {}
            // Queue is full of work already; run this one here.
            Err(DispatchError::Backpressure) => {
                if let Some(retry_at) = run_lane(&task, ctx).await {
                    let _ = ctx.report_tx.send(SyncReport { task, retry_at }).await;
                }
            }
            Err(DispatchError::Shutdown) => return,
        }
    }
}

/// Run `task` while holding its lane. Returns when the lane should be
/// looked at again, if ever.
async fn run_lane(task: &SyncTask, ctx: &WorkerContext) -> Option<DateTime<Utc>> {
    let lane = task.lane()?;
    let mut retry_at = None;

    loop {
        ctx.dirty.lock().await.insert(lane.clone());
        match ctx.lanes.try_acquire(&lane).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(lane = %lane, "lane busy, handed to owner");
                metric_inc("webhook.lane.busy");
                return None;
            }
            Err(err) => {
                tracing::warn!(lane = %lane, error = %err, "lane lock unavailable");
                return None;
            }
        }

        while ctx.dirty.lock().await.remove(&lane) {
            retry_at = run_cycles(task, ctx).await;
        }

        if let Err(err) = ctx.lanes.release(&lane).await {
            tracing::warn!(lane = %lane, error = %err, "failed to release lane");
        }

        // Work may have arrived between the last cycle and the release.
        if !ctx.dirty.lock().await.contains(&lane) {
            return retry_at;
        }
    }
}

async fn run_cycles(task: &SyncTask, ctx: &WorkerContext) -> Option<DateTime<Utc>> {
    match task {
        SyncTask::Subscription(id) => run_subscription(id, ctx).await,
        SyncTask::Payload(id) => match ctx.engine.deliver_payload(id, Utc::now()).await {
            Ok(outcome) => outcome.retry_at(),
            Err(err) => {
                tracing::warn!(payload = %id, error = %err, "payload delivery failed");
                None
            }
        },
        SyncTask::Model(_) => None,
    }
}

async fn run_subscription(id: &SubscriptionId, ctx: &WorkerContext) -> Option<DateTime<Utc>> {
    let budget = ctx.engine.config().max_packs_per_run.max(1);

    for _ in 0..budget {
        let outcome = match ctx.engine.run_cycle(id, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(subscription = %id, error = %err, "delivery cycle failed");
                return None;
            }
        };

        match outcome {
            CycleOutcome::Delivered { .. } | CycleOutcome::Stale { .. } => continue,
            other => return other.retry_at(),
        }
    }

    // Yield the lane; the rest of the backlog goes through the queue.
    if ctx.queue.try_enqueue(SyncTask::Subscription(id.clone())).is_err() {
        tracing::debug!(subscription = %id, "backlog left to the sweep");
    }
    None
}

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::WebhookConfig;
use crate::delivery::DeliveryEngine;
use crate::error::{DispatchError, WebhookError};
use crate::lock::{LaneLock, LocalLaneLock};
use crate::registry::{HookChain, ModelRegistry, ModelSchema};
use crate::storage::Storage;
use crate::subscriptions::SubscriptionService;
use crate::telemetry::metric_inc;
use crate::transport::Transport;
use crate::trigger::{ScheduleTrigger, SyncTask, TaskQueue};
use crate::types::{PayloadId, SubscriptionId};
use crate::worker::{worker_loop, SyncReport, WorkerContext};

// Delay before a timed task is offered to a full queue again.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Owns the worker pool, the retry scheduler and the periodic sweep.
///
/// Mutations never wait on it: the trigger only appends to the change log and
/// enqueues. Dropping the syncer without [`WebhookSyncer::shutdown`] leaves
/// the tasks running until the runtime stops.
pub struct WebhookSyncer {
    config: WebhookConfig,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn Storage>,
    engine: Arc<DeliveryEngine>,
    trigger: Arc<ScheduleTrigger>,
    queue: TaskQueue,
    is_running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl WebhookSyncer {
    /// Start with an in-process lane lock.
    pub async fn start(
        config: WebhookConfig,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, WebhookError> {
        Self::start_with_lanes(config, registry, storage, transport, Arc::new(LocalLaneLock::new())).await
    }

    /// Start with a caller-provided lane lock, e.g. a Redis one shared by
    /// several processes.
    pub async fn start_with_lanes(
        config: WebhookConfig,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        lanes: Arc<dyn LaneLock>,
    ) -> Result<Self, WebhookError> {
        config.validate()?;

        let (queue, ready_rx) = TaskQueue::bounded(config.queue_size);
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (report_tx, report_rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(DeliveryEngine::new(config.clone(), storage.clone(), transport));
        let trigger = Arc::new(ScheduleTrigger::new(registry.clone(), storage.clone(), queue.clone()));

        let ctx = Arc::new(WorkerContext {
            engine: engine.clone(),
            lanes,
            dirty: Mutex::new(HashSet::new()),
            queue: queue.clone(),
            report_tx,
        });

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_ready_rx.clone(),
                ctx.clone(),
                shutdown_rx.clone(),
            )));
        }

        let scheduler = Scheduler {
            queue: queue.clone(),
            registry: registry.clone(),
            storage: storage.clone(),
            sweep_interval: config.sweep_interval,
        };
        let scheduler_handle = tokio::spawn(scheduler.run(report_rx, shutdown_rx));

        tracing::info!(
            workers = config.worker_count,
            queue_size = config.queue_size,
            "webhook syncer started"
        );

        Ok(Self {
            config,
            registry,
            storage,
            engine,
            trigger,
            queue,
            is_running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
        })
    }

    /// Hook to append to the after-change chain of tracked models.
    pub fn trigger(&self) -> Arc<ScheduleTrigger> {
        self.trigger.clone()
    }

    /// Enable webhooks for a model and return its chain with the trigger
    /// appended once. Newly registered models are swept right away.
    pub fn register_model(&self, schema: impl Into<ModelSchema>, chain: HookChain) -> HookChain {
        let schema = schema.into();
        let model = schema.name.clone();
        let before = chain.len();
        let chain = self.registry.register_model(schema, chain, self.trigger.clone());
        if chain.len() > before {
            let _ = self.queue.try_enqueue(SyncTask::Model(model));
        }
        chain
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> Arc<DeliveryEngine> {
        self.engine.clone()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Management of webhooks, subscriptions and standalone payloads.
    pub fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.config.clone(), self.registry.clone(), self.storage.clone())
    }

    /// Ask for a delivery run of one subscription.
    pub fn sync_subscription(&self, id: SubscriptionId) -> Result<(), DispatchError> {
        self.enqueue(SyncTask::Subscription(id))
    }

    /// Ask for delivery of a standalone payload.
    pub fn enqueue_payload(&self, id: PayloadId) -> Result<(), DispatchError> {
        self.enqueue(SyncTask::Payload(id))
    }

    fn enqueue(&self, task: SyncTask) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        self.queue.try_enqueue(task)
    }

    /// Stop accepting work, let in-flight lanes finish and join all tasks.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("webhook syncer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    task: SyncTask,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Scheduler {
    queue: TaskQueue,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn Storage>,
    sweep_interval: Option<Duration>,
}

impl Scheduler {
    async fn run(self, mut report_rx: mpsc::Receiver<SyncReport>, mut shutdown: watch::Receiver<bool>) {
        let mut delay_heap: BinaryHeap<TimedTask> = BinaryHeap::new();
        // Startup sweep recovers work left behind by a previous process.
        let mut next_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let now = Instant::now();
            if now >= next_sweep {
                self.sweep().await;
                next_sweep = match self.sweep_interval {
                    Some(interval) => now + interval,
                    None => far_future(),
                };
            }

            // Move due retries into the queue.
            while let Some(timed) = delay_heap.peek() {
                if timed.ready_at > now {
                    break;
                }
                let Some(timed) = delay_heap.pop() else { break };
                match self.queue.try_enqueue(timed.task.clone()) {
                    Ok(()) => {}
                    Err(DispatchError::Backpressure) => {
                        delay_heap.push(TimedTask {
                            ready_at: now + REQUEUE_DELAY,
                            task: timed.task,
                        });
                        break;
                    }
                    Err(DispatchError::Shutdown) => return,
                }
            }

            let wake_at = delay_heap
                .peek()
                .map(|timed| timed.ready_at.min(next_sweep))
                .unwrap_or(next_sweep);

            tokio::select! {
                report = report_rx.recv() => match report {
                    Some(report) => {
                        metric_inc("webhook.scheduler.timed");
                        delay_heap.push(TimedTask {
                            ready_at: instant_for(report.retry_at),
                            task: report.task,
                        });
                    }
                    None => return,
                },
                _ = sleep_until(wake_at) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn sweep(&self) {
        let models = self.registry.models();
        tracing::debug!(models = models.len(), "sweeping registered models");

        for model in models {
            if let Err(DispatchError::Shutdown) = self.queue.try_enqueue(SyncTask::Model(model)) {
                return;
            }
        }

        match self.storage.open_standalone_payloads().await {
            Ok(payloads) => {
                for payload in payloads {
                    if let Err(DispatchError::Shutdown) = self.queue.try_enqueue(SyncTask::Payload(payload.id)) {
                        return;
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to load open payloads"),
        }
    }
}

fn instant_for(at: DateTime<Utc>) -> Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delay
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 60 * 60)
}

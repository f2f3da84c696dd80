#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use webhook_sync::{
    AfterChange, ChangeRecord, DeliveryEngine, HookChain, InMemoryStorage, ModelRegistry, ModelSchema, NewChange,
    Operation, OutboundRequest, Storage, Transport, TransportError, TransportResponse, Webhook, WebhookConfig,
    WebhookSubscription,
};

pub const SECRET: &str = "supersecret";

/// Fixed start of every test timeline.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

/// Deterministic retry timing for engine tests.
pub fn test_config() -> WebhookConfig {
    WebhookConfig::default()
        .with_retry_policy(60_000, 3_600_000, 0)
        .with_workers(2)
        .with_sweep_interval(None)
}

pub fn user_schema() -> ModelSchema {
    ModelSchema::new("User", ["id", "name", "email", "status", "age"])
}

/// Transport answering from a script, then with 200 OK.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<OutboundRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub fn push(&self, response: Result<TransportResponse, TransportError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_status(&self, status: u16, reason: &str, body: &str) {
        self.push(Ok(TransportResponse::new(status, body).with_reason(reason)));
    }

    pub fn fail_times(&self, n: usize) {
        for _ in 0..n {
            self.push_status(500, "Internal Server Error", "boom");
        }
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Most requests that were ever open at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Parsed JSON bodies of every request so far.
    pub fn bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(open, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(TransportResponse::new(200, "ok").with_reason("OK")))
    }
}

/// Storage, registry and engine wired together with one webhook.
pub struct Fixture {
    pub storage: Arc<InMemoryStorage>,
    pub registry: Arc<ModelRegistry>,
    pub transport: Arc<ScriptedTransport>,
    pub engine: DeliveryEngine,
    pub webhook: Webhook,
    pub config: WebhookConfig,
}

struct NoopHook;

#[async_trait]
impl webhook_sync::AfterChangeHook for NoopHook {
    fn name(&self) -> &str {
        "noop"
    }

    async fn after_change(&self, _change: &AfterChange) {}
}

impl Fixture {
    pub async fn new(config: WebhookConfig) -> Self {
        Self::with_transport(config, Arc::new(ScriptedTransport::new())).await
    }

    pub async fn with_transport(config: WebhookConfig, transport: Arc<ScriptedTransport>) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(ModelRegistry::new());
        registry.register_model(user_schema(), HookChain::new(), Arc::new(NoopHook));

        let webhook = Webhook::new("crm", "https://receiver.example.com/hook", "user-1", SECRET);
        storage.insert_webhook(&webhook).await.unwrap();

        let engine = DeliveryEngine::new(config.clone(), storage.clone(), transport.clone());
        Self { storage, registry, transport, engine, webhook, config }
    }

    /// Subscription to `User` starting at `t0`.
    pub fn subscription(&self) -> WebhookSubscription {
        WebhookSubscription::new(self.webhook.id.clone(), "User").synced_from(t0())
    }

    pub async fn subscribe(&self, subscription: WebhookSubscription) -> WebhookSubscription {
        self.storage.insert_subscription(&subscription).await.unwrap();
        subscription
    }

    pub async fn change(&self, item: &str, operation: Operation, at: DateTime<Utc>) -> ChangeRecord {
        self.change_with(item, operation, at, json!({ "id": item, "name": format!("user {}", item), "status": "active" }))
            .await
    }

    pub async fn change_with(
        &self,
        item: &str,
        operation: Operation,
        at: DateTime<Utc>,
        data: Value,
    ) -> ChangeRecord {
        self.storage
            .append_change(NewChange {
                model: "User".into(),
                item_id: item.into(),
                operation,
                data,
                changed_at: at,
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, subscription: &WebhookSubscription) -> WebhookSubscription {
        self.storage.load_subscription(&subscription.id).await.unwrap().unwrap()
    }
}

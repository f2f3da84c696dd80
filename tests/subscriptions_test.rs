mod common;

use serde_json::json;
use webhook_sync::{
    ConfigError, CycleOutcome, NewPayload, PayloadStatus, SelectorError, SkipReason, SubscriptionPatch,
    SubscriptionService, Webhook, WebhookError, WebhookId, WebhookSubscription,
};

use common::{hours, secs, t0, test_config, Fixture, SECRET};

fn service(fx: &Fixture) -> SubscriptionService {
    SubscriptionService::new(fx.config.clone(), fx.registry.clone(), fx.storage.clone())
}

#[tokio::test]
async fn test_create_webhook_requires_secret() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);

    let err = service
        .create_webhook(Webhook::new("crm", "https://x.example.com", "user-1", "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::MissingSecret));

    let webhook = service
        .create_webhook(Webhook::new("crm", "https://x.example.com", "user-1", "s3cret").with_description("CRM sync"))
        .await
        .unwrap();
    assert_eq!(webhook.description.as_deref(), Some("CRM sync"));
}

#[tokio::test]
async fn test_create_subscription_validates_and_normalizes() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);

    let created = service
        .create_subscription(
            WebhookSubscription::new(fx.webhook.id.clone(), "User")
                .with_fields("id,name")
                .with_filters(json!({ "status": "active" })),
        )
        .await
        .unwrap();
    assert_eq!(created.fields.as_deref(), Some("{ id name }"));
    assert_eq!(service.subscription(&created.id).await.unwrap().fields.as_deref(), Some("{ id name }"));

    let err = service
        .create_subscription(WebhookSubscription::new(fx.webhook.id.clone(), "Post"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::UnregisteredModel { .. }));

    let err = service
        .create_subscription(WebhookSubscription::new(fx.webhook.id.clone(), "User").with_fields("{ id password }"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Selector(SelectorError::UnknownField { .. })));

    let err = service
        .create_subscription(
            WebhookSubscription::new(fx.webhook.id.clone(), "User").with_filters(json!({ "salary_gt": 1 })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Selector(SelectorError::UnknownField { .. })));

    let err = service
        .create_subscription(WebhookSubscription::new(fx.webhook.id.clone(), "User").with_max_pack_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Config(ConfigError::ZeroPackSize)));

    let err = service
        .create_subscription(WebhookSubscription::new(WebhookId::from("nope"), "User"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::NotFound { kind: "webhook", .. }));
}

#[tokio::test]
async fn test_update_subscription() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let created = service
        .create_subscription(WebhookSubscription::new(fx.webhook.id.clone(), "User"))
        .await
        .unwrap();

    let patch = SubscriptionPatch {
        fields: Some(Some("id email".to_string())),
        max_pack_size: Some(Some(5)),
        ..SubscriptionPatch::default()
    };
    let updated = service.update_subscription(&created.id, patch).await.unwrap();
    assert_eq!(updated.fields.as_deref(), Some("{ id email }"));
    assert_eq!(updated.max_pack_size, Some(5));

    let bad = SubscriptionPatch {
        filters: Some(json!({ "unknown": 1 })),
        ..SubscriptionPatch::default()
    };
    assert!(service.update_subscription(&created.id, bad).await.is_err());
    assert_eq!(service.subscription(&created.id).await.unwrap().filters, updated.filters);

    let err = service
        .update_subscription(&"missing".into(), SubscriptionPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::NotFound { kind: "subscription", .. }));
}

#[tokio::test]
async fn test_delete_subscription_stops_delivery() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", webhook_sync::Operation::Create, t0() + secs(1)).await;

    assert!(service.delete_subscription(&sub.id, t0()).await.unwrap());
    assert!(!service.delete_subscription(&sub.id, t0()).await.unwrap());

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Deleted));
}

#[tokio::test]
async fn test_delete_webhook() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);

    assert!(service.delete_webhook(&fx.webhook.id, t0()).await.unwrap());
    let err = service
        .create_subscription(WebhookSubscription::new(fx.webhook.id.clone(), "User"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::NotFound { .. }));
}

#[tokio::test]
async fn test_reactivate_subscription() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let mut sub = fx.subscription();
    sub.failures_count = 12;
    sub.next_probe_at = Some(t0() + hours(5));
    let sub = fx.subscribe(sub).await;

    service.reactivate_subscription(&sub.id).await.unwrap();
    let sub = service.subscription(&sub.id).await.unwrap();
    assert_eq!(sub.failures_count, 0);
    assert_eq!(sub.next_probe_at, None);

    let err = service.reactivate_subscription(&"missing".into()).await.unwrap_err();
    assert!(matches!(err, WebhookError::NotFound { .. }));
}

#[tokio::test]
async fn test_payload_history_of_subscription() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let sub = fx.subscribe(fx.subscription().with_max_pack_size(1)).await;
    fx.change("u1", webhook_sync::Operation::Create, t0() + secs(1)).await;
    fx.change("u2", webhook_sync::Operation::Create, t0() + secs(2)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let history = service.payloads(&sub.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|payload| payload.status == PayloadStatus::Sent));
    assert_eq!(service.payload(&history[0].id).await.unwrap().id, history[0].id);
}

#[tokio::test]
async fn test_create_payload_validation() {
    let fx = Fixture::new(test_config().with_custom_event_type("billing.invoice_paid")).await;
    let service = service(&fx);
    let body = json!({ "invoice": 7 }).to_string();

    let err = service
        .create_payload(NewPayload::new("https://x", "", "User.created", "User", body.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::MissingSecret));

    let err = service
        .create_payload(NewPayload::new("https://x", SECRET, "User.created", "User", "{not json"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidPayload(_)));

    let err = service
        .create_payload(NewPayload::new("https://x", SECRET, "User.archived", "User", body.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidEventType(_)));

    let payload = service
        .create_payload(
            NewPayload::new("https://x", SECRET, "billing.invoice_paid", "Invoice", body).with_item_id("inv-7"),
        )
        .await
        .unwrap();
    assert_eq!(payload.status, PayloadStatus::Pending);
    assert_eq!(payload.attempt, 0);
    assert_eq!(payload.subscription_id, None);
    assert_eq!(payload.item_id.as_ref().map(|id| id.as_str()), Some("inv-7"));
}

#[tokio::test]
async fn test_standalone_payload_delivery() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let body = json!({ "hello": "world" }).to_string();
    let payload = service
        .create_payload(NewPayload::new("https://standalone.example.com", SECRET, "User.created", "User", body.clone()))
        .await
        .unwrap();
    fx.transport.fail_times(1);

    let now = payload.created_at;
    let outcome = fx.engine.deliver_payload(&payload.id, now).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Failed { attempt: 1, .. }));

    let outcome = fx.engine.deliver_payload(&payload.id, now + secs(1)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Backoff { .. })));

    let outcome = fx.engine.deliver_payload(&payload.id, now + secs(60)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { changes: 0, .. }));

    let stored = service.payload(&payload.id).await.unwrap();
    assert_eq!(stored.status, PayloadStatus::Sent);
    assert_eq!(stored.attempt, 2);

    let request = &fx.transport.requests()[1];
    assert_eq!(request.url, "https://standalone.example.com");
    assert_eq!(request.body, body.as_bytes());

    let outcome = fx.engine.deliver_payload(&payload.id, now + secs(120)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::AlreadyFinal));
    assert_eq!(fx.transport.request_count(), 2);
}

#[tokio::test]
async fn test_standalone_payload_expires() {
    let fx = Fixture::new(test_config()).await;
    let service = service(&fx);
    let payload = service
        .create_payload(
            NewPayload::new("https://x", SECRET, "User.updated", "User", "{}").with_expires_at(t0() + hours(1)),
        )
        .await
        .unwrap();

    let outcome = fx.engine.deliver_payload(&payload.id, t0() + hours(2)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Expired { .. }));

    let stored = service.payload(&payload.id).await.unwrap();
    assert_eq!(stored.status, PayloadStatus::Expired);
    assert_eq!(stored.attempt, 0);
    assert_eq!(stored.last_error_message.as_deref(), Some(webhook_sync::EXPIRED_MESSAGE));
    assert_eq!(fx.transport.request_count(), 0);
}

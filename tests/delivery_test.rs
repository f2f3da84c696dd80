mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use webhook_sync::{
    verify_signature, CursorAdvance, CycleOutcome, Operation, PayloadStatus, SkipReason, Storage, TransportError,
    EXPIRED_MESSAGE,
};

use common::{hours, secs, t0, test_config, Fixture, ScriptedTransport, SECRET};

#[tokio::test]
async fn test_success_advances_cursor() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription()).await;

    fx.change("u1", Operation::Create, t0() + secs(1)).await;
    fx.change("u2", Operation::Create, t0() + secs(2)).await;
    let last = fx.change("u1", Operation::Update, t0() + secs(3)).await;

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { changes: 3, .. }));

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.synced_at, last.changed_at);
    assert_eq!(sub.synced_amount, 3);
    assert_eq!(sub.failures_count, 0);

    let payloads = fx.storage.payloads().await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].status, PayloadStatus::Sent);
    assert_eq!(payloads[0].attempt, 1);
    assert_eq!(payloads[0].last_http_status_code, Some(200));
    assert_eq!(payloads[0].event_type, "User.updated");
    assert_eq!(payloads[0].item_id.as_ref().map(|id| id.as_str()), Some("u1"));

    // Zero pending changes: nothing sent, nothing moved.
    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(2)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert_eq!(fx.transport.request_count(), 1);
    assert_eq!(fx.storage.payloads().await.len(), 1);
}

#[tokio::test]
async fn test_request_is_signed_and_shaped() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let requests = fx.transport.requests();
    let request = &requests[0];
    let payload = &fx.storage.payloads().await[0];

    assert_eq!(request.url, fx.webhook.url);
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("X-Webhook-Id"), Some(payload.id.as_str()));
    let signature = request.header("X-Webhook-Signature").unwrap();
    assert!(verify_signature(SECRET.as_bytes(), &request.body, signature));
    assert_eq!(request.body, payload.payload.as_bytes());

    let body = &fx.transport.bodies()[0];
    assert_eq!(body["id"], json!(payload.id.as_str()));
    assert_eq!(body["eventType"], "User.created");
    assert_eq!(body["modelName"], "User");
    assert_eq!(body["itemId"], "u1");
    assert_eq!(body["subscriptionId"], json!(sub.id.as_str()));
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["id"], "u1");
    assert_eq!(body["data"][0]["operation"], "create");
    assert_eq!(body["data"][0]["fields"]["name"], "user u1");
}

#[tokio::test]
async fn test_subscription_url_and_secret_override() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx
        .subscribe(
            fx.subscription()
                .with_url("https://other.example.com/in")
                .with_secret("override"),
        )
        .await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let request = &fx.transport.requests()[0];
    assert_eq!(request.url, "https://other.example.com/in");
    let signature = request.header("X-Webhook-Signature").unwrap();
    assert!(verify_signature(b"override", &request.body, signature));
    assert!(!verify_signature(SECRET.as_bytes(), &request.body, signature));
}

#[tokio::test]
async fn test_pack_size_two_with_five_changes() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription().with_max_pack_size(2)).await;
    for (i, item) in ["c1", "c2", "c3", "c4", "c5"].iter().enumerate() {
        fx.change(item, Operation::Create, t0() + secs(i as i64 + 1)).await;
    }

    let now = t0() + hours(1);
    let mut amounts = Vec::new();
    for _ in 0..3 {
        let outcome = fx.engine.run_cycle(&sub.id, now).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Delivered { .. }));
        amounts.push(fx.reload(&sub).await.synced_amount);
    }
    assert_eq!(amounts, vec![2, 4, 5]);
    assert_eq!(fx.engine.run_cycle(&sub.id, now).await.unwrap(), CycleOutcome::Idle);

    let delivered: Vec<String> = fx
        .transport
        .bodies()
        .iter()
        .flat_map(|body| {
            body["data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|change| change["id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(delivered, vec!["c1", "c2", "c3", "c4", "c5"]);

    let counts: Vec<u64> = fx.transport.bodies().iter().map(|body| body["count"].as_u64().unwrap()).collect();
    assert_eq!(counts, vec![2, 2, 1]);
}

#[tokio::test]
async fn test_three_http_500_keep_payload_retryable() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(3);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    for k in 1..=3 {
        let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(k)).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { attempt, .. } if attempt == k as u32));
    }

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.failures_count, 3);
    assert_eq!(sub.synced_at, t0());
    assert_eq!(sub.synced_amount, 0);

    let payloads = fx.storage.payloads().await;
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload.attempt, 3);
    assert_eq!(payload.status, PayloadStatus::Failed);
    assert!(!payload.status.is_terminal());
    assert_eq!(payload.last_http_status_code, Some(500));
    assert_eq!(payload.last_response_body.as_deref(), Some("boom"));
    assert_eq!(payload.last_error_message.as_deref(), Some("HTTP 500: Internal Server Error"));
}

#[tokio::test]
async fn test_backoff_delays_retry() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(2);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    let now = t0() + hours(1);
    let outcome = fx.engine.run_cycle(&sub.id, now).await.unwrap();
    assert_eq!(outcome.retry_at(), Some(now + secs(60)));

    // Not due yet.
    let outcome = fx.engine.run_cycle(&sub.id, now + secs(30)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Backoff { until: now + secs(60) }));
    assert_eq!(fx.transport.request_count(), 1);

    // Second failure doubles the delay.
    let later = now + secs(60);
    let outcome = fx.engine.run_cycle(&sub.id, later).await.unwrap();
    assert_eq!(outcome.retry_at(), Some(later + secs(120)));

    let outcome = fx.engine.run_cycle(&sub.id, later + secs(120)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { changes: 1, .. }));
    assert_eq!(fx.reload(&sub).await.failures_count, 0);
    assert_eq!(fx.storage.payloads().await.len(), 1);
}

#[tokio::test]
async fn test_threshold_suspends_until_probe() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(10);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    for k in 1..=10 {
        fx.engine.run_cycle(&sub.id, t0() + hours(k)).await.unwrap();
    }
    let suspended = fx.reload(&sub).await;
    assert_eq!(suspended.failures_count, 10);
    assert!(suspended.is_unavailable(fx.config.unavailability_threshold));
    assert_eq!(suspended.next_probe_at, Some(t0() + hours(10) + chrono::Duration::minutes(30)));

    // No attempts while suspended, even once the retry itself is due.
    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(10) + chrono::Duration::minutes(20)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Unavailable { failures: 10, .. })));
    assert_eq!(fx.transport.request_count(), 10);
    assert_eq!(fx.reload(&sub).await.synced_at, t0());

    // Probe time: one attempt goes out and recovers the subscription.
    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(10) + chrono::Duration::minutes(31)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { .. }));
    let recovered = fx.reload(&sub).await;
    assert_eq!(recovered.failures_count, 0);
    assert_eq!(recovered.next_probe_at, None);
    assert_eq!(recovered.synced_amount, 1);
}

#[tokio::test]
async fn test_failed_probe_reschedules() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(11);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    for k in 1..=10 {
        fx.engine.run_cycle(&sub.id, t0() + hours(k)).await.unwrap();
    }

    let probe_at = t0() + hours(11);
    let outcome = fx.engine.run_cycle(&sub.id, probe_at).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Failed { attempt: 11, .. }));

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.failures_count, 11);
    assert_eq!(sub.next_probe_at, Some(probe_at + chrono::Duration::minutes(30)));
}

#[tokio::test]
async fn test_manual_reactivation() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(10);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;
    for k in 1..=10 {
        fx.engine.run_cycle(&sub.id, t0() + hours(k)).await.unwrap();
    }

    assert!(fx.engine.reactivate(&sub.id).await.unwrap());
    let reactivated = fx.reload(&sub).await;
    assert_eq!(reactivated.failures_count, 0);
    assert_eq!(reactivated.next_probe_at, None);

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(12)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { .. }));
}

#[tokio::test]
async fn test_expired_payload_is_repacked() {
    let config = test_config();
    let config = webhook_sync::WebhookConfig {
        payload_ttl: Duration::from_secs(2 * 60 * 60),
        ..config
    };
    let fx = Fixture::new(config).await;
    fx.transport.fail_times(1);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    let created_at = t0() + hours(1);
    fx.engine.run_cycle(&sub.id, created_at).await.unwrap();

    let outcome = fx.engine.run_cycle(&sub.id, created_at + hours(3)).await.unwrap();
    let CycleOutcome::Expired { payload_id } = outcome else {
        panic!("expected expiry, got {:?}", outcome);
    };

    let expired = fx.storage.load_payload(&payload_id).await.unwrap().unwrap();
    assert_eq!(expired.status, PayloadStatus::Expired);
    assert_eq!(expired.attempt, 1);
    assert_eq!(expired.last_error_message.as_deref(), Some(EXPIRED_MESSAGE));
    assert_eq!(fx.reload(&sub).await.synced_at, t0());

    // Same changes go out again in a fresh payload.
    let outcome = fx.engine.run_cycle(&sub.id, created_at + hours(4)).await.unwrap();
    let CycleOutcome::Delivered { payload_id: fresh, changes } = outcome else {
        panic!("expected delivery, got {:?}", outcome);
    };
    assert_ne!(fresh, payload_id);
    assert_eq!(changes, 1);

    let bodies = fx.transport.bodies();
    assert_eq!(bodies[0]["data"], bodies[1]["data"]);
    assert_eq!(fx.storage.payloads().await.len(), 2);
}

#[tokio::test]
async fn test_retry_past_expiry_expires_immediately() {
    let config = webhook_sync::WebhookConfig {
        payload_ttl: Duration::from_secs(30),
        ..test_config()
    };
    let fx = Fixture::new(config).await;
    fx.transport.fail_times(1);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Expired { .. }));

    let payload = &fx.storage.payloads().await[0];
    assert_eq!(payload.status, PayloadStatus::Expired);
    assert_eq!(payload.attempt, 1);
    assert_eq!(payload.last_error_message.as_deref(), Some("HTTP 500: Internal Server Error"));

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.failures_count, 1);
    assert_eq!(sub.synced_at, t0());
}

#[tokio::test]
async fn test_timeout_is_a_network_failure() {
    let config = test_config().with_request_timeout(Duration::from_millis(50));
    let fx = Fixture::with_transport(config, Arc::new(ScriptedTransport::with_delay(Duration::from_secs(5)))).await;
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Failed { attempt: 1, .. }));

    let payload = &fx.storage.payloads().await[0];
    assert_eq!(payload.last_http_status_code, None);
    assert_eq!(payload.last_error_message.as_deref(), Some("request timeout"));
    assert_eq!(fx.reload(&sub).await.failures_count, 1);
}

#[tokio::test]
async fn test_network_error_message() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.push(Err(TransportError::Network("connection refused".to_string())));
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let payload = &fx.storage.payloads().await[0];
    assert_eq!(payload.last_http_status_code, None);
    assert_eq!(payload.last_response_body, None);
    assert_eq!(payload.last_error_message.as_deref(), Some("network error: connection refused"));
}

#[tokio::test]
async fn test_response_body_is_truncated() {
    let config = webhook_sync::WebhookConfig {
        max_response_body_len: 10,
        ..test_config()
    };
    let fx = Fixture::new(config).await;
    fx.transport.push_status(502, "Bad Gateway", &"x".repeat(50));
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let payload = &fx.storage.payloads().await[0];
    assert_eq!(payload.last_response_body.as_deref(), Some("xxxxxxxxxx"));
    assert_eq!(payload.last_error_message.as_deref(), Some("HTTP 502: Bad Gateway"));
}

#[tokio::test]
async fn test_deleted_subscription_and_webhook_are_skipped() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.storage.soft_delete_subscription(&sub.id, t0()).await.unwrap();
    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Deleted));

    let other = fx.subscribe(fx.subscription()).await;
    fx.storage.soft_delete_webhook(&fx.webhook.id, t0()).await.unwrap();
    let outcome = fx.engine.run_cycle(&other.id, t0() + hours(1)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Deleted));

    assert_eq!(fx.transport.request_count(), 0);
    assert!(fx.storage.payloads().await.is_empty());
}

#[tokio::test]
async fn test_filtered_changes_move_cursor_silently() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx
        .subscribe(fx.subscription().with_filters(json!({ "status": "active" })))
        .await;

    let inactive = json!({ "id": "u2", "status": "blocked" });
    fx.change("u1", Operation::Create, t0() + secs(1)).await;
    fx.change_with("u2", Operation::Create, t0() + secs(2), inactive.clone()).await;
    let last_active = fx.change("u3", Operation::Create, t0() + secs(3)).await;
    let tail = fx
        .change_with("u4", Operation::Create, t0() + secs(4), json!({ "id": "u4", "status": "blocked" }))
        .await;

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Delivered { changes: 2, .. }));
    assert_eq!(fx.reload(&sub).await.synced_at, last_active.changed_at);

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.synced_at, tail.changed_at);
    assert_eq!(sub.synced_amount, 2);
    assert_eq!(fx.storage.payloads().await.len(), 1);
}

#[tokio::test]
async fn test_filtered_changes_keep_failure_count() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(1);
    let sub = fx
        .subscribe(fx.subscription().with_operations(webhook_sync::Operations::only(&[Operation::Create])))
        .await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    fx.engine.run_cycle(&sub.id, t0() + hours(2)).await.unwrap();
    assert_eq!(fx.reload(&sub).await.failures_count, 0);

    // Only updates pending, none wanted: cursor moves, counter stays.
    fx.storage.record_failure(&sub.id, 10, t0()).await.unwrap();
    fx.change("u1", Operation::Update, t0() + secs(5)).await;
    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(3)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.synced_at, t0() + secs(5));
    assert_eq!(sub.failures_count, 1);
}

#[tokio::test]
async fn test_field_selection_projects_snapshots() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription().with_fields("{ id name }")).await;
    fx.change_with(
        "u1",
        Operation::Create,
        t0() + secs(1),
        json!({ "id": "u1", "name": "Ann", "email": "ann@example.com" }),
    )
    .await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let body = &fx.transport.bodies()[0];
    assert_eq!(body["data"][0]["fields"], json!({ "id": "u1", "name": "Ann" }));
}

#[tokio::test]
async fn test_lost_cursor_race_is_stale() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;
    let second = fx.change("u2", Operation::Create, t0() + secs(2)).await;

    // Payload built from the original position...
    let pack = fx
        .engine
        .packer()
        .next_pack(fx.storage.as_ref(), &sub)
        .await
        .unwrap()
        .unwrap();
    let payload = fx.engine.create_pack_payload(&sub, &fx.webhook, &pack, t0() + hours(1)).unwrap();
    fx.storage.insert_payload(&payload).await.unwrap();

    // ...while somebody else already moved the cursor.
    let moved = fx
        .storage
        .compare_and_advance(
            &sub.id,
            &sub.position(),
            &CursorAdvance { through: second.key(), delivered: 2, reset_failures: true },
        )
        .await
        .unwrap();
    assert!(moved);

    let outcome = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Stale { payload_id: payload.id.clone() });

    let sub = fx.reload(&sub).await;
    assert_eq!(sub.synced_amount, 2);
    assert_eq!(sub.synced_at, second.changed_at);
    let stored = fx.storage.load_payload(&payload.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PayloadStatus::Sent);
}

#[tokio::test]
async fn test_changes_within_one_microsecond_are_all_delivered() {
    let fx = Fixture::new(test_config().with_max_pack_size(1)).await;
    let sub = fx.subscribe(fx.subscription()).await;
    let at = t0() + secs(1);
    let first = fx.change("b", Operation::Create, at + chrono::Duration::nanoseconds(100)).await;
    let second = fx.change("a", Operation::Create, at + chrono::Duration::nanoseconds(200)).await;

    // The log keeps microseconds, so both sort by item id at the same instant.
    assert_eq!(first.changed_at, at);
    assert_eq!(second.changed_at, at);

    for _ in 0..3 {
        fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();
    }

    let delivered: Vec<Value> = fx.transport.bodies().iter().map(|body| body["data"][0]["id"].clone()).collect();
    assert_eq!(delivered, vec![json!("a"), json!("b")]);
    assert_eq!(fx.reload(&sub).await.synced_amount, 2);
}

#[tokio::test]
async fn test_subscription_payload_is_not_sent_by_id() {
    let fx = Fixture::new(test_config()).await;
    fx.transport.fail_times(1);
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;

    let CycleOutcome::Failed { payload_id, .. } = fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap() else {
        panic!("expected a failed attempt");
    };

    let outcome = fx.engine.deliver_payload(&payload_id, t0() + hours(2)).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Skipped(SkipReason::OwnedBySubscription { subscription_id: sub.id.clone() })
    );
    assert_eq!(fx.transport.request_count(), 1);
    let stored = fx.storage.load_payload(&payload_id).await.unwrap().unwrap();
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.status, PayloadStatus::Failed);
}

#[tokio::test]
async fn test_deleted_item_reaches_subscriber() {
    let fx = Fixture::new(test_config()).await;
    let sub = fx.subscribe(fx.subscription()).await;
    fx.change("u1", Operation::Create, t0() + secs(1)).await;
    fx.change("u1", Operation::Delete, t0() + secs(2)).await;

    fx.engine.run_cycle(&sub.id, t0() + hours(1)).await.unwrap();

    let body = &fx.transport.bodies()[0];
    assert_eq!(body["eventType"], "User.deleted");
    assert_eq!(body["data"][1]["operation"], "delete");
    assert_eq!(body["data"][1]["id"], "u1");
    assert_eq!(body["data"][1]["fields"]["name"], "user u1");
}

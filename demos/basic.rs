use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use webhook_sync::{
    AfterChange, HookChain, HttpTransport, InMemoryStorage, ModelRegistry, ModelSchema, Operation, Webhook,
    WebhookConfig, WebhookSubscription, WebhookSyncer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let storage = Arc::new(InMemoryStorage::new());
    let mut syncer = WebhookSyncer::start(
        WebhookConfig::default(),
        Arc::new(ModelRegistry::new()),
        storage,
        Arc::new(HttpTransport::new()),
    )
    .await?;

    let users = syncer.register_model(ModelSchema::new("User", ["id", "name", "email"]), HookChain::new());

    let service = syncer.subscriptions();
    let webhook = service
        .create_webhook(Webhook::new("crm", "https://example.com/webhook", "user_1", "supersecret"))
        .await?;
    service
        .create_subscription(
            WebhookSubscription::new(webhook.id, "User")
                .with_fields("{ id name }")
                .with_max_pack_size(50),
        )
        .await?;

    // What the mutation pipeline does after committing a change.
    let change = AfterChange::new("User", Operation::Update)
        .with_existing_item(json!({ "id": "123", "name": "Ann" }))
        .with_updated_item(json!({ "id": "123", "name": "Anna", "email": "anna@example.com" }));
    users.run(&change).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    syncer.shutdown().await;
    Ok(())
}

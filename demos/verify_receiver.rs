use webhook_sync::{compute_signature, verify_webhook_request};

fn main() {
    let body = br#"{"id":"p_1","eventType":"User.updated","count":1,"data":[]}"#;
    let signature = compute_signature(b"supersecret", body);

    let headers = vec![
        ("X-Webhook-Id", "p_1"),
        ("X-Webhook-Signature", signature.as_str()),
    ];

    match verify_webhook_request(
        headers.iter().map(|(k, v)| (*k, *v)),
        body,
        b"supersecret",
        "X-Webhook-Id",
        "X-Webhook-Signature",
    ) {
        // Deliveries are at-least-once: drop ids already processed.
        Ok(payload_id) => println!("verified delivery {}", payload_id),
        Err(err) => println!("rejected: {:?}", err),
    }
}

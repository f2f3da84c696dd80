use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::types::{PayloadId, WebhookPayload};

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the exact body bytes.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against the body.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Headers attached to every delivery of `payload`.
pub fn build_delivery_headers(payload: &WebhookPayload, config: &WebhookConfig) -> Vec<(String, String)> {
    let signature = compute_signature(payload.secret.as_bytes(), payload.payload.as_bytes());
    vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        (config.id_header.clone(), payload.id.0.clone()),
        (config.signature_header.clone(), signature),
    ]
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub webhook_id: Option<String>,
    pub signature: Option<String>,
}

/// Pick the payload id and signature out of received headers.
/// Header names compare case-insensitively.
pub fn parse_signature_headers<'a, I>(
    headers: I,
    id_header: &str,
    signature_header: &str,
) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut webhook_id = None;
    let mut signature = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(signature_header) {
            signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(id_header) {
            webhook_id = Some(value.to_string());
        }
    }

    ParsedSignature { webhook_id, signature }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingWebhookId,
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming delivery in one call.
///
/// Returns the payload id, which receivers use to drop duplicates.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    id_header: &str,
    signature_header: &str,
) -> Result<PayloadId, VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers, id_header, signature_header);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let webhook_id = parsed.webhook_id.ok_or(VerificationError::MissingWebhookId)?;

    if verify_signature(secret, body, &signature) {
        Ok(PayloadId(webhook_id))
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

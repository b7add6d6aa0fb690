/// Inbound email webhook endpoint
///
/// Providers POST one delivery per email. The raw body is kept so an optional
/// `x-webhook-signature` (hex HMAC-SHA256, optionally `sha256=`-prefixed) can be checked
/// before anything is parsed. Per-recipient outcomes never fail the request.

use crate::{
    api::AppState,
    error::{EngineError, EngineResult},
    inbound::WebhookResponse,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::{post, Router},
};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/email", post(receive_email))
}

/// Hex HMAC-SHA256 of `body`
pub fn sign_payload(secret: &str, body: &[u8]) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a signature header against `body`
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// POST /api/webhooks/email
async fn receive_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> EngineResult<Json<WebhookResponse>> {
    tracing::info!("📥 Email webhook received ({} bytes)", body.len());

    if let (Some(secret), Some(signature)) = (
        state.config.email.webhook_secret.as_deref(),
        headers.get(SIGNATURE_HEADER),
    ) {
        let valid = signature
            .to_str()
            .map(|s| verify_signature(secret, &body, s))
            .unwrap_or(false);
        if !valid {
            return Err(EngineError::Unauthenticated("Invalid webhook signature".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("❌ Invalid JSON in email webhook: {}", e);
        EngineError::InvalidArgument(format!("Invalid JSON payload: {}", e))
    })?;

    let response = state
        .inbound
        .process(&payload)
        .await
        .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip_with_and_without_prefix() {
        let body = br#"{"event":"email_received"}"#;
        let signature = sign_payload("s3cret", body).unwrap();

        assert!(verify_signature("s3cret", body, &signature));
        assert!(verify_signature("s3cret", body, &format!("sha256={}", signature)));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("s3cret", b"{}", &signature));
        assert!(!verify_signature("s3cret", body, "not-hex"));
    }
}

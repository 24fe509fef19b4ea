//! Instagram messaging webhook: subscription handshake and event intake.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::AppError;
use crate::post_context::{enhance_message, PostContextExtractor};
use crate::store::StoreError;
use crate::types::{
    Business, MessagingEvent, NewMessageLog, WebhookEntry, WebhookPayload, PLATFORM_INSTAGRAM,
};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const MISSING_TOKEN_ERROR: &str = "missing page access token";

/// Checks `X-Hub-Signature-256` (hex HMAC-SHA256 of the raw body, optional
/// `sha256=` prefix). An empty secret disables the check.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, AppError> {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let verify_token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = state.config.verify_token.as_deref().unwrap_or("");

    if mode == "subscribe" && !challenge.is_empty() && !expected.is_empty() && verify_token == expected
    {
        info!("webhook verification succeeded");
        return Ok(challenge);
    }
    warn!(mode, "webhook verification rejected");
    Err(AppError::VerificationFailed)
}

pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    match state.config.app_secret.as_deref() {
        Some(secret) => {
            let signature_header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
            if !verify_signature(secret, signature_header, &body) {
                warn!("rejected webhook with invalid signature");
                return Err(AppError::InvalidSignature);
            }
        }
        None => debug!("FB_APP_SECRET not set, skipping signature verification"),
    }

    let payload = serde_json::from_slice::<WebhookPayload>(&body)
        .map_err(|err| AppError::BadRequest(format!("malformed webhook payload: {err}")))?;
    if payload.object != "instagram" && payload.object != "page" {
        debug!(object = %payload.object, "webhook object is not instagram");
    }

    let mut processed = 0usize;
    for entry in &payload.entry {
        let business = match state.store.active_business_by_page_id(&entry.id).await {
            Ok(Some(business)) => business,
            Ok(None) => {
                debug!(page_id = %entry.id, "no active business for page, skipping entry");
                continue;
            }
            Err(err) => {
                error!(page_id = %entry.id, error = %err, "business lookup failed");
                continue;
            }
        };

        for event in &entry.messaging {
            match handle_event(&state, &business, entry, event).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(business_id = business.id, error = %err, "failed to process messaging event");
                }
            }
        }
    }

    Ok(Json(json!({ "received": true, "processed": processed })))
}

/// Returns whether a reply was attempted for the event.
async fn handle_event(
    state: &AppState,
    business: &Business,
    entry: &WebhookEntry,
    event: &MessagingEvent,
) -> Result<bool, StoreError> {
    let Some(message) = event.message.as_ref() else {
        return Ok(false);
    };
    if message.is_echo {
        return Ok(false);
    }
    debug!(
        business_id = business.id,
        mid = ?message.mid,
        timestamp = ?event.timestamp,
        "processing messaging event"
    );
    if !business.ai_enabled {
        debug!(business_id = business.id, "AI disabled for business, skipping");
        return Ok(false);
    }
    if let Some(mid) = message.mid.as_deref().filter(|mid| !mid.is_empty()) {
        if !state.store.claim_inbound_event(business.id, mid).await? {
            info!(business_id = business.id, mid, "duplicate webhook delivery, skipping");
            return Ok(false);
        }
    }

    let (sender_id, reachable) = match event.sender.as_ref().map(|s| s.id.trim()) {
        Some(id) if !id.is_empty() && id != entry.id => (id.to_string(), true),
        _ => (format!("unknown_{}", Uuid::new_v4()), false),
    };
    let text = message.text.as_deref().unwrap_or("");

    state
        .store
        .append_message_log(NewMessageLog::incoming(business.id, &sender_id, text))
        .await?;
    if !reachable {
        // No recipient the platform could deliver to.
        warn!(
            business_id = business.id,
            sender_id = %sender_id,
            "sender missing or equal to page id, logged without reply"
        );
        return Ok(false);
    }

    let (customer, created) = state
        .store
        .get_or_create_customer(business.id, PLATFORM_INSTAGRAM, &sender_id)
        .await?;
    if created && !business.allow_auto_reply_from_unknown {
        info!(
            business_id = business.id,
            sender_id = %sender_id,
            "first contact from unknown customer, auto-reply disabled"
        );
        return Ok(false);
    }

    let post_context = match PostContextExtractor::new(state.gateway.as_ref())
        .extract(business, message)
        .await
    {
        Some(context) => {
            state
                .post_contexts
                .remember(business.id, &sender_id, context.clone())
                .await;
            Some(context)
        }
        None => state.post_contexts.recall(business.id, &sender_id).await,
    };
    let enhanced = enhance_message(text, post_context.as_ref());

    let reply = state
        .responder
        .respond(business.id, &enhanced, Some(&sender_id))
        .await;

    let send_error = match business.access_token() {
        Some(token) => state
            .gateway
            .send_text(token, &sender_id, &reply)
            .await
            .err()
            .map(|err| err.to_string()),
        None => Some(MISSING_TOKEN_ERROR.to_string()),
    };
    if let Some(err) = send_error.as_deref() {
        error!(business_id = business.id, sender_id = %sender_id, error = err, "reply not delivered");
    }

    state
        .store
        .append_message_log(NewMessageLog::outgoing(
            business.id,
            Some(customer.id),
            &sender_id,
            &reply,
            send_error,
        ))
        .await?;
    Ok(true)
}

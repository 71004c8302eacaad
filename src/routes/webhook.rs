// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook route for Gmail push notifications (via Pub/Sub push).

use crate::error::AppError;
use crate::services::processor::Notification;
use crate::services::pubsub_auth::PushAuthError;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook/gmail", post(handle_notification))
}

/// Pub/Sub push envelope.
#[derive(Deserialize, Debug)]
struct PushEnvelope {
    message: PushMessage,
    #[serde(default)]
    subscription: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// Handle a push delivery (POST).
///
/// Once authenticated, every delivery is acknowledged with 200 so Pub/Sub
/// does not redeliver; processing runs in the background.
async fn handle_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let sender = state.push_verifier.verify(&headers).await.map_err(|e| match e {
        PushAuthError::Forbidden(reason) => {
            tracing::warn!(reason = %reason, "Rejected push notification");
            AppError::Authenticity(reason)
        }
        PushAuthError::Transient(reason) => {
            tracing::error!(reason = %reason, "Push verification transient failure");
            AppError::Internal(anyhow::anyhow!("Push verification unavailable: {}", reason))
        }
    })?;

    tracing::debug!(
        email = %sender.email,
        subject = %sender.subject,
        "Push notification authenticated"
    );

    match decode_notification(&body) {
        Some(notification) => {
            tracing::info!(
                email = %notification.email_address,
                history_id = %notification.history_id,
                "Gmail notification received"
            );
            state.spawn_processing(notification);
        }
        None => {
            tracing::warn!("Push notification without emailAddress/historyId, acknowledging");
        }
    }

    Ok((StatusCode::OK, Json(json!({"success": true}))))
}

/// Extract `{emailAddress, historyId}` from a push body.
///
/// `historyId` arrives as a number from Gmail but is accepted as a string too.
fn decode_notification(body: &[u8]) -> Option<Notification> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .inspect_err(|e| tracing::warn!(error = %e, "Malformed push envelope"))
        .ok()?;

    tracing::debug!(
        message_id = envelope.message.message_id.as_deref().unwrap_or("<none>"),
        subscription = envelope.subscription.as_deref().unwrap_or("<none>"),
        "Decoding push message"
    );

    let data = envelope.message.data?;
    let raw = STANDARD
        .decode(data.trim())
        .or_else(|_| URL_SAFE.decode(data.trim()))
        .ok()?;
    let payload: Value = serde_json::from_slice(&raw).ok()?;

    let email_address = payload
        .get("emailAddress")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let history_id = match payload.get("historyId")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };

    Some(Notification {
        email_address,
        history_id,
    })
}

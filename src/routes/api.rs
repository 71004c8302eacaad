// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Gmail connection API for authenticated users.

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::models::WatchStatus;
use crate::services::WatchResult;
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// API routes (require authentication via JWT).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/gmail/exchange", post(exchange_code))
        .route("/api/gmail/watch", post(renew_watch))
        .route("/api/gmail/status", get(get_status))
        .route("/api/gmail/connection", delete(disconnect))
}

// ─── Code Exchange ───────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub code: String,
    /// Redirect URI the code was issued for (`postmessage` for popup flows)
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeResponse {
    pub success: bool,
    pub watch_result: WatchResult,
}

#[derive(Serialize)]
pub struct ExchangeError {
    pub error: String,
    pub status: u16,
}

/// Exchange a code obtained by the single-page flow and start the watch.
///
/// Failures answer `{error, status}` with the same HTTP status.
async fn exchange_code(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ExchangeRequest>,
) -> Response {
    let redirect_uri = req
        .redirect_uri
        .as_deref()
        .unwrap_or(&state.config.google_redirect_uri);

    let result = async {
        if req.code.trim().is_empty() {
            return Err(crate::error::AppError::BadRequest(
                "code must not be empty".to_string(),
            ));
        }
        state
            .token_manager
            .exchange_and_store(&user.user_id, &req.code, redirect_uri)
            .await?;
        state.watch_registrar.renew(&user.user_id).await
    }
    .await;

    match result {
        Ok(watch_result) => Json(ExchangeResponse {
            success: true,
            watch_result,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(user_id = %user.user_id, error = %e, "Code exchange failed");
            let status = e.status_code();
            (
                status,
                Json(ExchangeError {
                    error: e.code().to_string(),
                    status: status.as_u16(),
                }),
            )
                .into_response()
        }
    }
}

// ─── Watch ───────────────────────────────────────────────────

/// Renew the Gmail watch (subscriptions lapse after about a week).
async fn renew_watch(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<WatchResult>> {
    Ok(Json(state.watch_registrar.renew(&user.user_id).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: WatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<StatusResponse>> {
    let watch = state.watch_registrar.status(&user.user_id).await?;

    Ok(Json(StatusResponse {
        status: watch.status,
        email_address: watch.email_address,
        history_id: watch.history_id,
        expiration: watch.expiration,
    }))
}

// ─── Disconnect ──────────────────────────────────────────────

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<StatusCode> {
    state.watch_registrar.disconnect(&user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

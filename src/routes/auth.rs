// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google OAuth authorization routes.

use axum::{
    extract::{Query, State},
    response::Redirect,
    routing::get,
    Extension, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::oauth_state;
use crate::AppState;

/// Callback route (public: Google redirects the browser here).
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth/google/callback", get(auth_callback))
}

/// Consent start (requires a session).
pub fn protected_routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth/google", get(auth_start))
}

/// Start OAuth flow - redirect to Google's consent screen.
async fn auth_start(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Redirect> {
    let signed_state = oauth_state::sign(&user.user_id, &state.config.oauth_state_key)?;

    let auth_url = state
        .google
        .authorization_url(&state.config.google_redirect_uri, &signed_state);

    tracing::info!(user_id = %user.user_id, "Starting OAuth flow, redirecting to Google");

    Ok(Redirect::temporary(&auth_url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback - exchange code, store tokens, start the watch.
///
/// Always redirects to the settings page, with either
/// `success=true&historyId=..` or `error=<reason>`.
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let settings_url = state.config.settings_url();
    let fail = |reason: &str| {
        Redirect::temporary(&format!(
            "{}?error={}",
            settings_url,
            urlencoding::encode(reason)
        ))
    };

    // Check for OAuth errors (e.g. the user declined consent)
    if let Some(error) = params.error {
        tracing::warn!(error = %error, "OAuth error from Google");
        return fail(&error);
    }

    let (Some(code), Some(signed_state)) = (params.code, params.state) else {
        tracing::warn!("OAuth callback without code or state");
        return fail("missing_code_or_state");
    };

    let Some(user_id) = oauth_state::verify(&signed_state, &state.config.oauth_state_key) else {
        tracing::warn!("Invalid or tampered state parameter");
        return fail("callback_error");
    };

    tracing::info!(user_id = %user_id, "Exchanging authorization code for tokens");

    if let Err(e) = state
        .token_manager
        .exchange_and_store(&user_id, &code, &state.config.google_redirect_uri)
        .await
    {
        tracing::error!(user_id = %user_id, error = %e, "Token exchange failed");
        return fail("token_exchange_failed");
    }

    match state.watch_registrar.renew(&user_id).await {
        Ok(watch) => {
            tracing::info!(user_id = %user_id, history_id = %watch.history_id, "Gmail connected");
            Redirect::temporary(&format!(
                "{}?success=true&historyId={}",
                settings_url,
                urlencoding::encode(&watch.history_id)
            ))
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Watch registration after OAuth failed");
            fail("callback_error")
        }
    }
}

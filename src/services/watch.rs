// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Gmail push subscription lifecycle.

use crate::db::Store;
use crate::error::AppError;
use crate::models::{WatchState, WatchStatus};
use crate::services::google::GoogleClient;
use crate::services::token_manager::TokenManager;
use crate::services::user_locks::UserLocks;
use crate::time_utils::{format_utc_rfc3339, from_epoch_millis};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of a successful watch registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResult {
    pub history_id: String,
    /// When the subscription lapses (RFC3339)
    pub expiration: Option<String>,
}

/// Subscribes mailboxes to push notifications and tears them down again.
#[derive(Clone)]
pub struct WatchRegistrar {
    google: GoogleClient,
    store: Arc<dyn Store>,
    token_manager: TokenManager,
    topic: String,
    label_ids: Vec<String>,
    /// Shared with the webhook processor so state writes never interleave.
    locks: UserLocks,
}

impl WatchRegistrar {
    pub fn new(
        google: GoogleClient,
        store: Arc<dyn Store>,
        token_manager: TokenManager,
        topic: String,
        label_ids: Vec<String>,
        locks: UserLocks,
    ) -> Self {
        Self {
            google,
            store,
            token_manager,
            topic,
            label_ids,
            locks,
        }
    }

    /// Register (or renew) the watch using a caller-supplied access token.
    ///
    /// The stored cursor is initialised from Gmail's answer when absent and
    /// otherwise left alone, so a renewal never skips unprocessed history.
    pub async fn register_watch(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<WatchResult, AppError> {
        let response = self
            .google
            .watch(access_token, &self.topic, &self.label_ids)
            .await
            .inspect_err(|e| tracing::warn!(user_id, error = %e, "Gmail watch rejected"))?;

        let email_address = match self.google.get_profile(access_token).await {
            Ok(profile) => Some(profile.email_address.trim().to_lowercase()),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Could not read mailbox address after watch");
                None
            }
        };

        // The processor may be moving the cursor; read it under the same lock.
        let _guard = self.locks.lock(user_id).await;
        let mut state = self
            .store
            .get_watch_state(user_id)
            .await?
            .unwrap_or_else(|| WatchState::new(user_id));

        if email_address.is_some() {
            state.email_address = email_address;
        }

        if state.cursor().is_none() {
            state.history_id = Some(response.history_id.clone());
        }

        let expiration = response
            .expiration
            .as_deref()
            .and_then(from_epoch_millis)
            .map(format_utc_rfc3339);

        state.expiration = expiration.clone();
        state.status = WatchStatus::Watching;
        state.updated_at = format_utc_rfc3339(Utc::now());
        self.store.set_watch_state(&state).await?;

        tracing::info!(
            user_id,
            history_id = %response.history_id,
            expiration = expiration.as_deref().unwrap_or("<none>"),
            "Gmail watch registered"
        );

        Ok(WatchResult {
            history_id: response.history_id,
            expiration,
        })
    }

    /// Renew the watch with a freshly obtained access token.
    pub async fn renew(&self, user_id: &str) -> Result<WatchResult, AppError> {
        let access_token = self.token_manager.get_valid_access_token(user_id).await?;
        self.register_watch(user_id, &access_token).await
    }

    /// Current integration state (unwatched when nothing is stored).
    pub async fn status(&self, user_id: &str) -> Result<WatchState, AppError> {
        Ok(self
            .store
            .get_watch_state(user_id)
            .await?
            .unwrap_or_else(|| WatchState::new(user_id)))
    }

    /// Stop the watch, revoke the grant and forget the credential.
    ///
    /// Calls to Google are best-effort; local state is always cleared.
    pub async fn disconnect(&self, user_id: &str) -> Result<(), AppError> {
        match self.token_manager.get_valid_access_token(user_id).await {
            Ok(access_token) => {
                if let Err(e) = self.google.stop(&access_token).await {
                    tracing::warn!(user_id, error = %e, "Failed to stop Gmail watch");
                }
            }
            Err(AppError::NoCredential(_)) => {}
            Err(e) => tracing::warn!(user_id, error = %e, "No usable token to stop Gmail watch"),
        }

        if let Some(refresh_token) = self.token_manager.revoke_local_tokens(user_id).await? {
            if let Err(e) = self.google.revoke(&refresh_token).await {
                tracing::warn!(user_id, error = %e, "Failed to revoke Google grant");
            }
        }

        let mut state = WatchState::new(user_id);
        state.updated_at = format_utc_rfc3339(Utc::now());
        {
            let _guard = self.locks.lock(user_id).await;
            self.store.set_watch_state(&state).await?;
        }

        tracing::info!(user_id, "Gmail disconnected");
        Ok(())
    }
}

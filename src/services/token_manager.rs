// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth token lifecycle for connected Gmail accounts.

use crate::db::Store;
use crate::error::AppError;
use crate::models::{OAuthCredential, WatchState, WatchStatus};
use crate::services::google::GoogleClient;
use crate::services::kms::{encrypt_tokens, token_aad, KmsService};
use crate::services::user_locks::UserLocks;
use crate::time_utils::{format_utc_rfc3339, parse_utc_rfc3339};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Cached access token with expiry information.
#[derive(Clone)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Shared token cache type for use in AppState.
pub type TokenCache = Arc<DashMap<String, CachedToken>>;

/// Manages stored Google credentials and hands out valid access tokens.
///
/// This service encapsulates:
/// - Encryption and storage of tokens after authorization
/// - Automatic refresh when a token is expiring (5-minute margin)
/// - In-memory caching of decrypted access tokens
/// - Per-user locking so one refresh runs at a time per user
/// - Compare-and-swap writes so a cross-instance refresh race keeps the winner
#[derive(Clone)]
pub struct TokenManager {
    google: GoogleClient,
    store: Arc<dyn Store>,
    kms: KmsService,
    token_cache: TokenCache,
    refresh_locks: UserLocks,
}

impl TokenManager {
    pub fn new(
        google: GoogleClient,
        store: Arc<dyn Store>,
        kms: KmsService,
        token_cache: TokenCache,
        refresh_locks: UserLocks,
    ) -> Self {
        Self {
            google,
            store,
            kms,
            token_cache,
            refresh_locks,
        }
    }

    // ─── Storing ─────────────────────────────────────────────────────────────

    /// Store a user's tokens, replacing any previous credential.
    ///
    /// Returns the computed expiry (`now + expires_in_secs`).
    pub async fn store_token(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: i64,
        scopes: Vec<String>,
    ) -> Result<DateTime<Utc>, AppError> {
        let now = Utc::now();
        let expires_at = expiry_after(now, expires_in_secs)?;

        let (access_token_encrypted, refresh_token_encrypted) =
            encrypt_tokens(&self.kms, access_token, refresh_token, user_id).await?;

        let credential = OAuthCredential {
            user_id: user_id.to_string(),
            access_token_encrypted,
            refresh_token_encrypted,
            expires_at: format_utc_rfc3339(expires_at),
            scopes,
            updated_at: format_utc_rfc3339(now),
        };

        self.store.upsert_credential(&credential).await?;
        self.cache(user_id, access_token, expires_at);

        tracing::info!(user_id, expires_at = %credential.expires_at, "OAuth tokens stored");
        Ok(expires_at)
    }

    /// Exchange an authorization code and store the resulting tokens.
    ///
    /// Google only returns a refresh token on first consent; when it is
    /// absent the previously stored one is kept.
    pub async fn exchange_and_store(
        &self,
        user_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<DateTime<Utc>, AppError> {
        let tokens = self.google.exchange_code(code, redirect_uri).await?;
        let scopes = tokens.scopes();

        let refresh_token = match tokens.refresh_token {
            Some(rt) => rt,
            None => self.stored_refresh_token(user_id).await?.ok_or_else(|| {
                AppError::GoogleApi("Authorization did not grant a refresh token".to_string())
            })?,
        };

        self.store_token(
            user_id,
            &tokens.access_token,
            &refresh_token,
            tokens.expires_in,
            scopes,
        )
        .await
    }

    // ─── Reading ─────────────────────────────────────────────────────────────

    /// Get a valid (non-expiring) access token for the given user.
    ///
    /// 1. Check in-memory cache (no I/O)
    /// 2. Acquire the per-user refresh lock and re-check the cache
    /// 3. Load the credential; a still-valid token is cached and returned
    /// 4. Otherwise refresh with Google and compare-and-swap the new tokens in
    ///
    /// A rejected refresh never falls back to the stale access token.
    pub async fn get_valid_access_token(&self, user_id: &str) -> Result<String, AppError> {
        if let Some(token) = self.cached_valid(user_id) {
            return Ok(token);
        }

        let _guard = self.refresh_locks.lock(user_id).await;

        // Another task may have refreshed while we were waiting.
        if let Some(token) = self.cached_valid(user_id) {
            return Ok(token);
        }

        let credential = self
            .store
            .get_credential(user_id)
            .await?
            .ok_or_else(|| AppError::NoCredential(user_id.to_string()))?;

        let aad = token_aad(user_id);
        let expires_at = parse_expiry(&credential)?;

        if Self::is_fresh(expires_at) {
            let access_token = self
                .kms
                .decrypt(&credential.access_token_encrypted, &aad)
                .await?;
            self.cache(user_id, &access_token, expires_at);
            return Ok(access_token);
        }

        tracing::info!(user_id, "Access token expired, refreshing");

        let refresh_token = self
            .kms
            .decrypt(&credential.refresh_token_encrypted, &aad)
            .await?;

        let refreshed = match self.google.refresh_access_token(&refresh_token).await {
            Ok(t) => t,
            Err(AppError::RefreshFailed(reason)) => {
                // Another instance may have rotated the refresh token under us.
                if let Some(token) = self.adopt_newer_credential(&credential).await? {
                    return Ok(token);
                }
                tracing::warn!(user_id, reason = %reason, "Refresh token rejected, re-authorization needed");
                self.mark_needs_reauth(user_id).await;
                return Err(AppError::RefreshFailed(reason));
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let new_expires_at = expiry_after(now, refreshed.expires_in)?;

        let access_token_encrypted = self.kms.encrypt(&refreshed.access_token, &aad).await?;
        let refresh_token_encrypted = match refreshed.refresh_token.as_deref() {
            Some(rotated) => self.kms.encrypt(rotated, &aad).await?,
            None => credential.refresh_token_encrypted.clone(),
        };

        let scopes = match refreshed.scopes() {
            s if s.is_empty() => credential.scopes.clone(),
            s => s,
        };

        let updated = OAuthCredential {
            user_id: user_id.to_string(),
            access_token_encrypted,
            refresh_token_encrypted,
            expires_at: format_utc_rfc3339(new_expires_at),
            scopes,
            updated_at: format_utc_rfc3339(now),
        };

        let written = self
            .store
            .replace_credential_if(&credential.refresh_token_encrypted, &updated)
            .await?;

        if !written {
            tracing::info!(
                user_id,
                "Refresh race detected - another writer won, using their tokens"
            );
            return self.fetch_and_cache_from_db(user_id).await;
        }

        self.cache(user_id, &refreshed.access_token, new_expires_at);

        tracing::info!(user_id, "Token refreshed and cached");
        Ok(refreshed.access_token)
    }

    // ─── Revocation ──────────────────────────────────────────────────────────

    /// Delete the stored credential and return the decrypted refresh token
    /// so the caller can revoke the grant upstream.
    pub async fn revoke_local_tokens(&self, user_id: &str) -> Result<Option<String>, AppError> {
        let credential = self.store.get_credential(user_id).await?;

        self.store.delete_credential(user_id).await?;
        self.token_cache.remove(user_id);

        let Some(credential) = credential else {
            return Ok(None);
        };

        match self
            .kms
            .decrypt(&credential.refresh_token_encrypted, &token_aad(user_id))
            .await
        {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!(error = %e, user_id, "Failed to decrypt refresh token (skipping revoke)");
                Ok(None)
            }
        }
    }

    /// Drop the cached access token (e.g. after Google rejected it).
    pub fn invalidate(&self, user_id: &str) {
        self.token_cache.remove(user_id);
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn is_fresh(expires_at: DateTime<Utc>) -> bool {
        Utc::now() + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < expires_at
    }

    fn cached_valid(&self, user_id: &str) -> Option<String> {
        self.token_cache
            .get(user_id)
            .filter(|cached| Self::is_fresh(cached.expires_at))
            .map(|cached| cached.access_token.clone())
    }

    fn cache(&self, user_id: &str, access_token: &str, expires_at: DateTime<Utc>) {
        self.token_cache.insert(
            user_id.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            },
        );
    }

    async fn stored_refresh_token(&self, user_id: &str) -> Result<Option<String>, AppError> {
        match self.store.get_credential(user_id).await? {
            Some(c) => Ok(Some(
                self.kms
                    .decrypt(&c.refresh_token_encrypted, &token_aad(user_id))
                    .await?,
            )),
            None => Ok(None),
        }
    }

    /// Use the stored credential if someone replaced the one we refreshed
    /// from with a token that is still fresh.
    async fn adopt_newer_credential(
        &self,
        stale: &OAuthCredential,
    ) -> Result<Option<String>, AppError> {
        let Some(current) = self.store.get_credential(&stale.user_id).await? else {
            return Ok(None);
        };

        if current.refresh_token_encrypted == stale.refresh_token_encrypted
            || !Self::is_fresh(parse_expiry(&current)?)
        {
            return Ok(None);
        }

        self.fetch_and_cache_from_db(&stale.user_id).await.map(Some)
    }

    /// Fetch tokens from the store (after losing a refresh race) and cache.
    async fn fetch_and_cache_from_db(&self, user_id: &str) -> Result<String, AppError> {
        let credential = self
            .store
            .get_credential(user_id)
            .await?
            .ok_or_else(|| AppError::NoCredential(user_id.to_string()))?;

        let access_token = self
            .kms
            .decrypt(&credential.access_token_encrypted, &token_aad(user_id))
            .await?;
        let expires_at = parse_expiry(&credential)?;

        self.cache(user_id, &access_token, expires_at);
        Ok(access_token)
    }

    async fn mark_needs_reauth(&self, user_id: &str) {
        self.token_cache.remove(user_id);

        let result = async {
            let mut state = self
                .store
                .get_watch_state(user_id)
                .await?
                .unwrap_or_else(|| WatchState::new(user_id));
            state.status = WatchStatus::NeedsReauth;
            state.updated_at = format_utc_rfc3339(Utc::now());
            self.store.set_watch_state(&state).await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, user_id, "Failed to mark mailbox as needing re-authorization");
        }
    }
}

fn parse_expiry(credential: &OAuthCredential) -> Result<DateTime<Utc>, AppError> {
    parse_utc_rfc3339(&credential.expires_at).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!(
            "Failed to parse expiry: {}",
            credential.expires_at
        ))
    })
}

/// `now + expires_in`, refusing lifetimes chrono cannot represent.
fn expiry_after(now: DateTime<Utc>, expires_in_secs: i64) -> Result<DateTime<Utc>, AppError> {
    Duration::try_seconds(expires_in_secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            AppError::GoogleApi(format!("Unusable token lifetime: {}s", expires_in_secs))
        })
}

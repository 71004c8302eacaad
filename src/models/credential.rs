// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stored OAuth credential (one per user).

use serde::{Deserialize, Serialize};

/// A user's Google OAuth tokens (encrypted in Firestore).
///
/// `access_token_encrypted` and `expires_at` are always written together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    /// Owning user ID (also used as document ID)
    pub user_id: String,
    /// Encrypted access token (base64)
    pub access_token_encrypted: String,
    /// Encrypted refresh token (base64)
    pub refresh_token_encrypted: String,
    /// When the access token expires (RFC3339)
    pub expires_at: String,
    /// Granted OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Last time the tokens were written (RFC3339)
    pub updated_at: String,
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User directory entry.

use serde::{Deserialize, Serialize};

/// Application user as seen by the ingestion pipeline.
///
/// Owned by the web app; this service only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Internal user ID (also used as document ID)
    pub id: String,
    /// Login email address
    pub email: String,
    /// Whether the identity provider verified `email`
    #[serde(default)]
    pub email_verified: bool,
    /// Wallet that receives transactions no other wallet claims
    #[serde(default)]
    pub default_wallet_id: Option<String>,
}

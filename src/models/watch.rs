// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user mailbox watch state and sync cursor.

use serde::{Deserialize, Serialize};

/// Lifecycle of a user's mailbox integration.
///
/// `Unwatched -> Watching` on a successful watch registration,
/// `Watching -> NeedsReauth` when the refresh token is rejected,
/// `* -> Unwatched` on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    #[default]
    Unwatched,
    Watching,
    NeedsReauth,
}

/// Watch subscription state for one user's mailbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchState {
    /// Owning user ID (also used as document ID)
    pub user_id: String,
    /// Mailbox address reported by Gmail (`users.getProfile`)
    #[serde(default)]
    pub email_address: Option<String>,
    /// Last fully processed history ID
    #[serde(default)]
    pub history_id: Option<String>,
    /// When the Gmail watch lapses (RFC3339)
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(default)]
    pub status: WatchStatus,
    /// Last update timestamp (RFC3339)
    #[serde(default)]
    pub updated_at: String,
}

impl WatchState {
    /// Fresh unwatched state for a user.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    /// Stored cursor as a number, if any.
    pub fn cursor(&self) -> Option<u64> {
        self.history_id.as_deref().and_then(parse_history_id)
    }

    /// Move the cursor forward to `history_id`.
    ///
    /// Returns `false` (and leaves the cursor untouched) when the new value
    /// is not ahead of the stored one.
    pub fn advance_cursor(&mut self, history_id: u64) -> bool {
        match self.cursor() {
            Some(current) if current >= history_id => false,
            _ => {
                self.history_id = Some(history_id.to_string());
                true
            }
        }
    }
}

/// History IDs travel as decimal strings on the wire.
pub fn parse_history_id(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

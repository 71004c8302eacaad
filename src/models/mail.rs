// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Email content handed to the transaction parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fetched Gmail message reduced to what the parser needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub from: String,
    pub subject: String,
    /// Plain-text body (HTML-only messages carry their HTML here)
    pub body: String,
    pub received_at: DateTime<Utc>,
}

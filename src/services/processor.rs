// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook notification processing.
//!
//! Handles the core workflow:
//! 1. Resolve the notified mailbox to a user
//! 2. Obtain a valid access token
//! 3. List mailbox history between the stored cursor and the notified ID
//! 4. Fetch, parse and persist each new message (failures isolated per message)
//! 5. Advance the cursor once the batch is done, but never past a message
//!    whose failure may succeed on a later attempt

use crate::db::{InsertOutcome, Store};
use crate::error::{AppError, Result};
use crate::models::watch::parse_history_id;
use crate::models::{MailMessage, Transaction, WatchState, WatchStatus};
use crate::services::google::GoogleClient;
use crate::services::parser::TransactionParser;
use crate::services::token_manager::TokenManager;
use crate::services::user_locks::UserLocks;
use crate::time_utils::format_utc_rfc3339;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Messages fetched from Gmail concurrently within one batch.
const FETCH_CONCURRENCY: usize = 4;

/// Decoded push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub email_address: String,
    pub history_id: String,
}

/// How a notification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Batch processed and cursor advanced.
    Processed,
    /// Some messages failed retriably; the cursor stops before the first.
    Incomplete,
    /// No user owns the mailbox.
    UnknownMailbox,
    /// The user must authorize again; nothing was fetched.
    NeedsReauth,
    /// No cursor was stored; it now starts at the notified ID.
    CursorInitialized,
    /// Notified ID is not ahead of the stored cursor.
    AlreadyProcessed,
    /// Gmail no longer has history back to the cursor; it was moved forward.
    HistoryExpired,
}

/// Per-message failure inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct MessageFailure {
    pub message_id: String,
    /// History record that announced the message
    pub history_id: u64,
    pub error: String,
    /// The message will be fetched again by a later notification.
    pub retriable: bool,
}

/// Message announced by a history record inside the window.
#[derive(Debug, Clone)]
struct PendingMessage {
    id: String,
    history_id: u64,
}

/// Summary of one processed notification.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub outcome: Outcome,
    pub user_id: Option<String>,
    /// Messages fetched from Gmail
    pub fetched: usize,
    /// Transactions newly stored
    pub persisted: usize,
    /// Transactions that were already stored
    pub duplicates: usize,
    /// Messages the parser did not recognize as transactions
    pub skipped: usize,
    pub failures: Vec<MessageFailure>,
    /// Cursor stored after this notification
    pub cursor: Option<u64>,
}

impl ProcessingReport {
    fn new(outcome: Outcome, user_id: Option<&str>) -> Self {
        Self {
            outcome,
            user_id: user_id.map(String::from),
            fetched: 0,
            persisted: 0,
            duplicates: 0,
            skipped: 0,
            failures: Vec::new(),
            cursor: None,
        }
    }

    /// Highest history ID the cursor may move to.
    ///
    /// Everything up to `notified` when no message failed retriably,
    /// otherwise the record just before the earliest such failure.
    fn safe_cursor(&self, cursor: u64, notified: u64) -> u64 {
        self.failures
            .iter()
            .filter(|f| f.retriable)
            .map(|f| f.history_id.saturating_sub(1))
            .min()
            .map_or(notified, |stop| stop.clamp(cursor, notified))
    }
}

/// Turns mailbox change notifications into stored transactions.
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    token_manager: TokenManager,
    google: GoogleClient,
    parser: Arc<dyn TransactionParser>,
    locks: UserLocks,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        token_manager: TokenManager,
        google: GoogleClient,
        parser: Arc<dyn TransactionParser>,
        locks: UserLocks,
    ) -> Self {
        Self {
            store,
            token_manager,
            google,
            parser,
            locks,
        }
    }

    /// Process one notification.
    ///
    /// Errors abort the whole notification without moving the cursor;
    /// per-message problems are collected in the report instead.
    pub async fn process(&self, notification: &Notification) -> Result<ProcessingReport> {
        let notified = parse_history_id(&notification.history_id).ok_or_else(|| {
            AppError::BadRequest(format!(
                "historyId is not numeric: {}",
                notification.history_id
            ))
        })?;

        let Some(user_id) = self
            .store
            .find_user_by_mailbox(&notification.email_address)
            .await?
        else {
            tracing::warn!(
                email = %notification.email_address,
                "Notification for a mailbox no user owns"
            );
            return Ok(ProcessingReport::new(Outcome::UnknownMailbox, None));
        };
        let user_id = user_id.as_str();

        // Deliveries for one mailbox must not race on the cursor.
        let _guard = self.locks.lock(user_id).await;

        let state = self
            .store
            .get_watch_state(user_id)
            .await?
            .unwrap_or_else(|| WatchState::new(user_id));

        if state.status == WatchStatus::NeedsReauth {
            tracing::info!(user_id, "Skipping notification until the user re-authorizes");
            return Ok(ProcessingReport::new(Outcome::NeedsReauth, Some(user_id)));
        }

        let access_token = self
            .token_manager
            .get_valid_access_token(user_id)
            .await
            .inspect_err(|e| tracing::warn!(user_id, error = %e, "No usable access token"))?;

        let Some(cursor) = state.cursor() else {
            self.save_cursor(user_id, notified).await?;
            tracing::info!(user_id, history_id = notified, "Cursor initialized from notification");
            let mut report = ProcessingReport::new(Outcome::CursorInitialized, Some(user_id));
            report.cursor = Some(notified);
            return Ok(report);
        };

        if notified <= cursor {
            tracing::debug!(user_id, cursor, notified, "Notification already covered by cursor");
            let mut report = ProcessingReport::new(Outcome::AlreadyProcessed, Some(user_id));
            report.cursor = Some(cursor);
            return Ok(report);
        }

        let messages = match self
            .collect_message_ids(user_id, &access_token, cursor, notified)
            .await
        {
            Ok(ids) => ids,
            Err(e) if e.is_history_expired() => {
                tracing::error!(
                    user_id,
                    cursor,
                    notified,
                    "Mailbox history expired, messages in the gap were not ingested"
                );
                self.save_cursor(user_id, notified).await?;
                let mut report = ProcessingReport::new(Outcome::HistoryExpired, Some(user_id));
                report.cursor = Some(notified);
                return Ok(report);
            }
            Err(e) => {
                if e.is_google_token_error() {
                    self.token_manager.invalidate(user_id);
                }
                return Err(e);
            }
        };

        let mut report = self
            .process_batch(user_id, &access_token, messages)
            .await?;

        let next_cursor = report.safe_cursor(cursor, notified);
        if next_cursor < notified {
            report.outcome = Outcome::Incomplete;
            tracing::warn!(
                user_id,
                cursor,
                notified,
                held_at = next_cursor,
                "Retriable failures in batch, cursor held for the next notification"
            );
        }
        if next_cursor > cursor {
            self.save_cursor(user_id, next_cursor).await?;
        }
        report.cursor = Some(next_cursor);

        tracing::info!(
            user_id,
            cursor = next_cursor,
            notified,
            fetched = report.fetched,
            persisted = report.persisted,
            duplicates = report.duplicates,
            skipped = report.skipped,
            failures = report.failures.len(),
            "Notification processed"
        );

        Ok(report)
    }

    /// Messages added in `(cursor, notified]`, first-seen order, without
    /// duplicates.
    async fn collect_message_ids(
        &self,
        user_id: &str,
        access_token: &str,
        cursor: u64,
        notified: u64,
    ) -> Result<Vec<PendingMessage>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .google
                .list_history(access_token, cursor, page_token.as_deref())
                .await?;

            for record in page.history {
                let Some(history_id) = parse_history_id(&record.id)
                    .filter(|id| *id > cursor && *id <= notified)
                else {
                    continue;
                };
                for added in record.messages_added {
                    if seen.insert(added.message.id.clone()) {
                        ids.push(PendingMessage {
                            id: added.message.id,
                            history_id,
                        });
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(user_id, count = ids.len(), "Collected new messages");
        Ok(ids)
    }

    async fn process_batch(
        &self,
        user_id: &str,
        access_token: &str,
        messages: Vec<PendingMessage>,
    ) -> Result<ProcessingReport> {
        let mut report = ProcessingReport::new(Outcome::Processed, Some(user_id));
        if messages.is_empty() {
            return Ok(report);
        }

        let wallets = self.store.list_wallets(user_id).await?;
        let default_wallet_id = self
            .store
            .get_user(user_id)
            .await?
            .and_then(|u| u.default_wallet_id);

        let fetched: Vec<(PendingMessage, Result<MailMessage>)> = stream::iter(messages)
            .map(|pending| async move {
                let message = self.google.get_message(access_token, &pending.id).await;
                (pending, message)
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        for (pending, message) in fetched {
            let message_id = pending.id.as_str();
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    if e.is_google_token_error() {
                        self.token_manager.invalidate(user_id);
                    }
                    record_failure(&mut report, &pending, e);
                    continue;
                }
            };
            report.fetched += 1;

            let parsed = match self.parser.parse(&message).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    record_failure(&mut report, &pending, e);
                    continue;
                }
            };

            let wallet_id = wallets
                .iter()
                .find(|w| w.matches(&parsed))
                .map(|w| w.id.clone())
                .or_else(|| default_wallet_id.clone());

            let tx = Transaction::from_parsed(
                parsed,
                user_id,
                wallet_id,
                &message.id,
                format_utc_rfc3339(message.received_at),
                format_utc_rfc3339(Utc::now()),
            );

            match self.store.insert_transaction(&tx).await {
                Ok(InsertOutcome::Inserted) => {
                    tracing::info!(user_id, message_id = %message_id, transaction_id = %tx.id, "Transaction stored");
                    report.persisted += 1;
                }
                Ok(InsertOutcome::Duplicate) => {
                    tracing::debug!(user_id, message_id = %message_id, transaction_id = %tx.id, "Transaction already stored");
                    report.duplicates += 1;
                }
                Err(e) => record_failure(&mut report, &pending, e),
            }
        }

        Ok(report)
    }

    /// Re-reads the state so fields written by a concurrent watch renewal
    /// survive.
    async fn save_cursor(&self, user_id: &str, history_id: u64) -> Result<()> {
        let mut state = self
            .store
            .get_watch_state(user_id)
            .await?
            .unwrap_or_else(|| WatchState::new(user_id));

        if state.advance_cursor(history_id) {
            state.updated_at = format_utc_rfc3339(Utc::now());
            self.store.set_watch_state(&state).await?;
        }
        Ok(())
    }
}

fn record_failure(report: &mut ProcessingReport, pending: &PendingMessage, error: AppError) {
    let retriable = error.is_retriable();
    tracing::warn!(
        message_id = %pending.id,
        history_id = pending.history_id,
        retriable,
        error = %error,
        "Message failed, continuing with batch"
    );
    report.failures.push(MessageFailure {
        message_id: pending.id.clone(),
        history_id: pending.history_id,
        error: error.to_string(),
        retriable,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(history_id: u64, retriable: bool) -> MessageFailure {
        MessageFailure {
            message_id: format!("m{history_id}"),
            history_id,
            error: "boom".to_string(),
            retriable,
        }
    }

    #[test]
    fn cursor_reaches_notified_without_retriable_failures() {
        let mut report = ProcessingReport::new(Outcome::Processed, None);
        assert_eq!(report.safe_cursor(10, 13), 13);

        report.failures.push(failure(12, false));
        assert_eq!(report.safe_cursor(10, 13), 13);
    }

    #[test]
    fn cursor_stops_before_earliest_retriable_failure() {
        let mut report = ProcessingReport::new(Outcome::Processed, None);
        report.failures.push(failure(13, true));
        report.failures.push(failure(12, true));
        assert_eq!(report.safe_cursor(10, 13), 11);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut report = ProcessingReport::new(Outcome::Processed, None);
        report.failures.push(failure(11, true));
        assert_eq!(report.safe_cursor(10, 13), 10);
    }
}

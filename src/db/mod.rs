// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Storage layer.
//!
//! The pipeline talks to storage through [`Store`]; production uses
//! Firestore, local development and tests use the in-memory backend.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDb;

use crate::error::AppError;
use crate::models::{OAuthCredential, Transaction, User, Wallet, WatchState};
use async_trait::async_trait;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const CREDENTIALS: &str = "oauth_credentials";
    pub const WATCH_STATES: &str = "watch_states";
    pub const WALLETS: &str = "wallets";
    pub const TRANSACTIONS: &str = "transactions";
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same ID already existed; nothing was written.
    Duplicate,
}

/// Persistence operations used by the ingestion pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    // ─── Credentials ─────────────────────────────────────────────

    async fn get_credential(&self, user_id: &str) -> Result<Option<OAuthCredential>, AppError>;

    /// Create or overwrite the user's credential.
    async fn upsert_credential(&self, credential: &OAuthCredential) -> Result<(), AppError>;

    /// Overwrite the credential only if the stored refresh token still
    /// equals `expected_refresh_encrypted`.
    ///
    /// Returns `false` when another writer got there first.
    async fn replace_credential_if(
        &self,
        expected_refresh_encrypted: &str,
        credential: &OAuthCredential,
    ) -> Result<bool, AppError>;

    async fn delete_credential(&self, user_id: &str) -> Result<(), AppError>;

    // ─── Watch State ─────────────────────────────────────────────

    async fn get_watch_state(&self, user_id: &str) -> Result<Option<WatchState>, AppError>;

    async fn set_watch_state(&self, state: &WatchState) -> Result<(), AppError>;

    // ─── User Directory ──────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError>;

    /// Resolve a notified mailbox address to the owning user ID.
    ///
    /// Watched mailboxes win; otherwise a user whose verified login email
    /// matches is returned.
    async fn find_user_by_mailbox(&self, email: &str) -> Result<Option<String>, AppError>;

    // ─── Wallets & Transactions ──────────────────────────────────

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError>;

    /// Insert a transaction unless one with the same ID exists.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<InsertOutcome, AppError>;
}

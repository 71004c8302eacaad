// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory store for local development and tests.

use crate::db::{InsertOutcome, Store};
use crate::error::AppError;
use crate::models::{OAuthCredential, Transaction, User, Wallet, WatchState};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-local [`Store`] backed by concurrent maps.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryDb {
    users: Arc<DashMap<String, User>>,
    credentials: Arc<DashMap<String, OAuthCredential>>,
    watch_states: Arc<DashMap<String, WatchState>>,
    wallets: Arc<DashMap<String, Wallet>>,
    transactions: Arc<DashMap<String, Transaction>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user directory entry.
    pub fn put_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Add or replace a wallet.
    pub fn put_wallet(&self, wallet: Wallet) {
        self.wallets.insert(wallet.id.clone(), wallet);
    }

    /// All stored transactions for a user, ordered by ID.
    pub fn transactions_for(&self, user_id: &str) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.value().clone())
            .collect();
        txs.sort_by(|a, b| a.id.cmp(&b.id));
        txs
    }

    /// Stored watch state for a user.
    pub fn watch_state(&self, user_id: &str) -> Option<WatchState> {
        self.watch_states.get(user_id).map(|s| s.value().clone())
    }

    /// Number of stored credentials (one per user at most).
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }
}

#[async_trait]
impl Store for MemoryDb {
    async fn get_credential(&self, user_id: &str) -> Result<Option<OAuthCredential>, AppError> {
        Ok(self.credentials.get(user_id).map(|c| c.value().clone()))
    }

    async fn upsert_credential(&self, credential: &OAuthCredential) -> Result<(), AppError> {
        self.credentials
            .insert(credential.user_id.clone(), credential.clone());
        Ok(())
    }

    async fn replace_credential_if(
        &self,
        expected_refresh_encrypted: &str,
        credential: &OAuthCredential,
    ) -> Result<bool, AppError> {
        match self.credentials.entry(credential.user_id.clone()) {
            Entry::Occupied(mut entry)
                if entry.get().refresh_token_encrypted == expected_refresh_encrypted =>
            {
                entry.insert(credential.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_credential(&self, user_id: &str) -> Result<(), AppError> {
        self.credentials.remove(user_id);
        Ok(())
    }

    async fn get_watch_state(&self, user_id: &str) -> Result<Option<WatchState>, AppError> {
        Ok(self.watch_states.get(user_id).map(|s| s.value().clone()))
    }

    async fn set_watch_state(&self, state: &WatchState) -> Result<(), AppError> {
        self.watch_states
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.get(user_id).map(|u| u.value().clone()))
    }

    async fn find_user_by_mailbox(&self, email: &str) -> Result<Option<String>, AppError> {
        let email = email.trim().to_lowercase();

        let watched = self
            .watch_states
            .iter()
            .find(|s| s.email_address.as_deref() == Some(email.as_str()))
            .map(|s| s.user_id.clone());
        if watched.is_some() {
            return Ok(watched);
        }

        Ok(self
            .users
            .iter()
            .find(|u| u.email_verified && u.email.eq_ignore_ascii_case(&email))
            .map(|u| u.id.clone()))
    }

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError> {
        let mut wallets: Vec<Wallet> = self
            .wallets
            .iter()
            .filter(|w| w.user_id == user_id)
            .map(|w| w.value().clone())
            .collect();
        wallets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(wallets)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<InsertOutcome, AppError> {
        match self.transactions.entry(tx.id.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::Duplicate),
            Entry::Vacant(entry) => {
                entry.insert(tx.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(user_id: &str, refresh: &str) -> OAuthCredential {
        OAuthCredential {
            user_id: user_id.to_string(),
            access_token_encrypted: "at".to_string(),
            refresh_token_encrypted: refresh.to_string(),
            expires_at: "2026-01-01T00:00:00Z".to_string(),
            scopes: vec![],
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn replace_if_requires_matching_refresh_token() {
        let db = MemoryDb::new();
        db.upsert_credential(&credential("u1", "rt-old")).await.unwrap();

        let replaced = db
            .replace_credential_if("rt-stale", &credential("u1", "rt-new"))
            .await
            .unwrap();
        assert!(!replaced);

        let replaced = db
            .replace_credential_if("rt-old", &credential("u1", "rt-new"))
            .await
            .unwrap();
        assert!(replaced);

        let stored = db.get_credential("u1").await.unwrap().unwrap();
        assert_eq!(stored.refresh_token_encrypted, "rt-new");
    }

    #[tokio::test]
    async fn replace_if_does_not_create_missing_credential() {
        let db = MemoryDb::new();
        let replaced = db
            .replace_credential_if("rt", &credential("u1", "rt-new"))
            .await
            .unwrap();
        assert!(!replaced);
        assert_eq!(db.credential_count(), 0);
    }

    #[tokio::test]
    async fn mailbox_lookup_prefers_watch_state_then_verified_email() {
        let db = MemoryDb::new();
        db.put_user(User {
            id: "u-unverified".to_string(),
            email: "a@b.com".to_string(),
            email_verified: false,
            default_wallet_id: None,
        });
        assert_eq!(db.find_user_by_mailbox("a@b.com").await.unwrap(), None);

        db.put_user(User {
            id: "u-verified".to_string(),
            email: "A@b.com".to_string(),
            email_verified: true,
            default_wallet_id: None,
        });
        assert_eq!(
            db.find_user_by_mailbox("a@b.com").await.unwrap().as_deref(),
            Some("u-verified")
        );

        let mut state = WatchState::new("u-watched");
        state.email_address = Some("a@b.com".to_string());
        db.set_watch_state(&state).await.unwrap();
        assert_eq!(
            db.find_user_by_mailbox(" A@B.com ").await.unwrap().as_deref(),
            Some("u-watched")
        );
    }
}

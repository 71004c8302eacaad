// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - OAuth credentials (encrypted tokens)
//! - Watch state (mailbox cursor and lifecycle)
//! - Users and wallets (read-only, owned by the web app)
//! - Transactions (insert-if-absent keyed by bank + reference number)

use crate::db::{collections, InsertOutcome, Store};
use crate::error::AppError;
use crate::models::{OAuthCredential, Transaction, User, Wallet, WatchState};
use async_trait::async_trait;
use firestore::FirestoreConsistencySelector;

/// Commits of the credential compare-and-swap before giving up.
const CAS_ATTEMPTS: u32 = 3;

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client; every operation returns an error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    async fn get_by_id<T>(&self, collection: &str, id: &str) -> Result<Option<T>, AppError>
    where
        T: for<'de> serde::Deserialize<'de> + Send,
    {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collection)
            .obj()
            .one(id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn set_by_id<T>(&self, collection: &str, id: &str, object: &T) -> Result<(), AppError>
    where
        T: serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync,
    {
        let _: T = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collection)
            .document_id(id)
            .object(object)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_watched_mailbox(&self, email: &str) -> Result<Option<String>, AppError> {
        let email = email.to_string();
        let states: Vec<WatchState> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::WATCH_STATES)
            .filter(move |q| q.for_all([q.field("email_address").eq(email.clone())]))
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(states.into_iter().next().map(|s| s.user_id))
    }

    async fn find_verified_user(&self, email: &str) -> Result<Option<String>, AppError> {
        let email = email.to_string();
        let users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| {
                q.for_all([
                    q.field("email").eq(email.clone()),
                    q.field("email_verified").eq(true),
                ])
            })
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(users.into_iter().next().map(|u| u.id))
    }
}

#[async_trait]
impl Store for FirestoreDb {
    // ─── Credential Operations ───────────────────────────────────

    async fn get_credential(&self, user_id: &str) -> Result<Option<OAuthCredential>, AppError> {
        self.get_by_id(collections::CREDENTIALS, user_id).await
    }

    async fn upsert_credential(&self, credential: &OAuthCredential) -> Result<(), AppError> {
        self.set_by_id(collections::CREDENTIALS, &credential.user_id, credential)
            .await
    }

    /// The read and the write share one Firestore transaction, so a
    /// concurrent refresh on another instance aborts our commit instead of
    /// being overwritten. An aborted commit is retried against fresh data.
    async fn replace_credential_if(
        &self,
        expected_refresh_encrypted: &str,
        credential: &OAuthCredential,
    ) -> Result<bool, AppError> {
        let client = self.get_client()?;
        let mut last_error = None;

        for attempt in 1..=CAS_ATTEMPTS {
            match try_replace_credential(client, expected_refresh_encrypted, credential).await {
                Ok(written) => return Ok(written),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        user_id = %credential.user_id,
                        error = %e,
                        "Credential swap did not commit"
                    );
                    last_error = Some(e);
                }
            }

            let current = self.get_credential(&credential.user_id).await?;
            if !current.is_some_and(|c| c.refresh_token_encrypted == expected_refresh_encrypted) {
                return Ok(false);
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Database("Credential swap failed".to_string())))
    }

    async fn delete_credential(&self, user_id: &str) -> Result<(), AppError> {
        self.get_client()?
            .fluent()
            .delete()
            .from(collections::CREDENTIALS)
            .document_id(user_id)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Watch State Operations ──────────────────────────────────

    async fn get_watch_state(&self, user_id: &str) -> Result<Option<WatchState>, AppError> {
        self.get_by_id(collections::WATCH_STATES, user_id).await
    }

    async fn set_watch_state(&self, state: &WatchState) -> Result<(), AppError> {
        self.set_by_id(collections::WATCH_STATES, &state.user_id, state)
            .await
    }

    // ─── User Directory ──────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.get_by_id(collections::USERS, user_id).await
    }

    async fn find_user_by_mailbox(&self, email: &str) -> Result<Option<String>, AppError> {
        let email = email.trim().to_lowercase();
        if let Some(user_id) = self.find_watched_mailbox(&email).await? {
            return Ok(Some(user_id));
        }
        self.find_verified_user(&email).await
    }

    // ─── Wallets & Transactions ──────────────────────────────────

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError> {
        let user_id = user_id.to_string();
        self.get_client()?
            .fluent()
            .select()
            .from(collections::WALLETS)
            .filter(move |q| q.for_all([q.field("user_id").eq(user_id.clone())]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<InsertOutcome, AppError> {
        if self
            .get_by_id::<Transaction>(collections::TRANSACTIONS, &tx.id)
            .await?
            .is_some()
        {
            return Ok(InsertOutcome::Duplicate);
        }

        // Firestore rejects a create on an existing document, which closes
        // the window between the read above and this write.
        let result: Result<Transaction, _> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::TRANSACTIONS)
            .document_id(&tx.id)
            .object(tx)
            .execute()
            .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(firestore::errors::FirestoreError::DataConflictError(_)) => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(AppError::Database(e.to_string())),
        }
    }
}

/// One compare-and-swap attempt inside a fresh transaction.
async fn try_replace_credential(
    client: &firestore::FirestoreDb,
    expected_refresh_encrypted: &str,
    credential: &OAuthCredential,
) -> Result<bool, AppError> {
    let mut transaction = client
        .begin_transaction()
        .await
        .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

    // Reads through this client are part of the transaction and guard the commit.
    let tx_client = client.clone_with_consistency_selector(FirestoreConsistencySelector::Transaction(
        transaction.transaction_id().clone(),
    ));

    let current: Option<OAuthCredential> = tx_client
        .fluent()
        .select()
        .by_id_in(collections::CREDENTIALS)
        .obj()
        .one(&credential.user_id)
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to read credential in transaction: {}", e))
        })?;

    let still_current = current
        .as_ref()
        .is_some_and(|c| c.refresh_token_encrypted == expected_refresh_encrypted);

    if !still_current {
        let _ = transaction.rollback().await;
        return Ok(false);
    }

    client
        .fluent()
        .update()
        .in_col(collections::CREDENTIALS)
        .document_id(&credential.user_id)
        .object(credential)
        .add_to_transaction(&mut transaction)
        .map_err(|e| {
            AppError::Database(format!("Failed to add credential to transaction: {}", e))
        })?;

    transaction
        .commit()
        .await
        .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;

    Ok(true)
}

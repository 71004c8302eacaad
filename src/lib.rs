// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Ojir mail ingest: turns bank notification emails into wallet transactions.
//!
//! This crate provides the backend that connects a user's Gmail mailbox
//! (OAuth + push watch), receives Gmail push notifications and stores the
//! transactions parsed from new messages.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod oauth_state;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::Store;
use error::AppError;
use services::{
    GoogleClient, GoogleEndpoints, KmsService, Notification, PushVerifier, TokenManager,
    TransactionParser, UserLocks, WatchRegistrar, WebhookProcessor,
};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub google: GoogleClient,
    pub token_manager: TokenManager,
    pub watch_registrar: WatchRegistrar,
    pub processor: WebhookProcessor,
    pub push_verifier: PushVerifier,
}

impl AppState {
    /// Wire the services together.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        kms: KmsService,
        endpoints: GoogleEndpoints,
        parser: Arc<dyn TransactionParser>,
        push_verifier: PushVerifier,
    ) -> Result<Self, AppError> {
        let google = GoogleClient::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            endpoints,
            config.http_timeout,
        )?;

        // Shared across all requests within this instance
        let token_manager = TokenManager::new(
            google.clone(),
            store.clone(),
            kms,
            Arc::new(dashmap::DashMap::new()),
            UserLocks::new(),
        );

        // Cursor writes from the processor and the registrar share one lock per user
        let mailbox_locks = UserLocks::new();

        let watch_registrar = WatchRegistrar::new(
            google.clone(),
            store.clone(),
            token_manager.clone(),
            config.gmail_pubsub_topic.clone(),
            config.gmail_watch_labels.clone(),
            mailbox_locks.clone(),
        );

        let processor = WebhookProcessor::new(
            store.clone(),
            token_manager.clone(),
            google.clone(),
            parser,
            mailbox_locks,
        );

        Ok(Self {
            config,
            store,
            google,
            token_manager,
            watch_registrar,
            processor,
            push_verifier,
        })
    }

    /// Process a notification in the background; outcomes are only logged.
    pub fn spawn_processing(&self, notification: Notification) -> tokio::task::JoinHandle<()> {
        let processor = self.processor.clone();
        tokio::spawn(async move {
            match processor.process(&notification).await {
                Ok(report) => tracing::debug!(report = ?report, "Notification handled"),
                Err(e) => tracing::error!(
                    email = %notification.email_address,
                    history_id = %notification.history_id,
                    error = %e,
                    "Notification processing aborted"
                ),
            }
        })
    }
}

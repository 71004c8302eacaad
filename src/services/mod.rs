// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod google;
pub mod kms;
pub mod parser;
pub mod processor;
pub mod pubsub_auth;
pub mod token_manager;
pub mod user_locks;
pub mod watch;

pub use google::{GoogleClient, GoogleEndpoints};
pub use kms::KmsService;
pub use parser::{HttpTransactionParser, TransactionParser};
pub use processor::{MessageFailure, Notification, Outcome, ProcessingReport, WebhookProcessor};
pub use pubsub_auth::{PushAuthError, PushVerifier, VerifiedPushSender};
pub use token_manager::{TokenCache, TokenManager};
pub use user_locks::UserLocks;
pub use watch::{WatchRegistrar, WatchResult};

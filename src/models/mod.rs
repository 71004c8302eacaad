// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod credential;
pub mod mail;
pub mod transaction;
pub mod user;
pub mod watch;

pub use credential::OAuthCredential;
pub use mail::MailMessage;
pub use transaction::{Direction, ParsedTransaction, Transaction, Wallet};
pub use user::User;
pub use watch::{WatchState, WatchStatus};

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Notification processing against mocked Gmail and parser services.

use async_trait::async_trait;
use ojir_mail_ingest::db::{InsertOutcome, MemoryDb, Store};
use ojir_mail_ingest::error::AppError;
use ojir_mail_ingest::models::{
    OAuthCredential, Transaction, User, Wallet, WatchState, WatchStatus,
};
use ojir_mail_ingest::services::{Notification, Outcome};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{
    create_test_app, create_test_app_with_store, mount_history, mount_message, mount_watch,
    parsed_transaction, seed_watched_user, TestApp,
};

const EMAIL: &str = "owner@example.com";

fn notification(history_id: &str) -> Notification {
    Notification {
        email_address: EMAIL.to_string(),
        history_id: history_id.to_string(),
    }
}

async fn mount_parse(parser: &MockServer, message_id: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/parse"))
        .and(body_partial_json(json!({"messageId": message_id})))
        .respond_with(response)
        .mount(parser)
        .await;
}

async fn cursor_of(app: &TestApp, user_id: &str) -> Option<String> {
    app.db
        .get_watch_state(user_id)
        .await
        .unwrap()
        .and_then(|s| s.history_id)
}

#[tokio::test]
async fn only_messages_inside_the_window_are_ingested() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "90").await;

    mount_history(&app.google, "90", &[("95", "m1"), ("100", "m2"), ("105", "m3")]).await;
    mount_message(&app.google, "m1", "Transfer 1").await;
    mount_message(&app.google, "m2", "Transfer 2").await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&app.google)
        .await;

    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;
    mount_parse(&app.parser, "m2", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-2"))).await;

    let report = app.state.processor.process(&notification("100")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Processed);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.persisted, 2);
    assert!(report.failures.is_empty());
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("100"));

    let stored = app.db.transactions_for("user-1");
    let refs: Vec<_> = stored.iter().map(|t| t.ref_no.as_str()).collect();
    assert_eq!(refs, vec!["REF-1", "REF-2"]);
    assert!(stored.iter().all(|t| t.wallet_id.as_deref() == Some("user-1-wallet")));
}

fn stored_refs(app: &TestApp, user_id: &str) -> Vec<String> {
    app.db
        .transactions_for(user_id)
        .into_iter()
        .map(|t| t.ref_no)
        .collect()
}

#[tokio::test]
async fn parser_outage_holds_cursor_until_message_is_ingested() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "m1"), ("12", "m2"), ("13", "m3")]).await;
    for id in ["m1", "m2", "m3"] {
        mount_message(&app.google, id, "Transfer").await;
    }
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;
    Mock::given(method("POST"))
        .and(path("/parse"))
        .and(body_partial_json(json!({"messageId": "m2"})))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&app.parser)
        .await;
    mount_parse(&app.parser, "m2", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-2"))).await;
    mount_parse(&app.parser, "m3", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-3"))).await;

    let report = app.state.processor.process(&notification("13")).await.unwrap();

    // One bad message does not stop the others.
    assert_eq!(report.outcome, Outcome::Incomplete);
    assert_eq!(report.persisted, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].message_id, "m2");
    assert!(report.failures[0].retriable);
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-3"]);

    // Cursor stops at the record before m2.
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("11"));

    // The next notification lists from 11 again and picks m2 up.
    mount_history(&app.google, "11", &[("12", "m2"), ("13", "m3"), ("14", "m4")]).await;
    mount_message(&app.google, "m4", "Promo").await;
    mount_parse(&app.parser, "m4", ResponseTemplate::new(200).set_body_json(json!({"transaction": null}))).await;

    let report = app.state.processor.process(&notification("14")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Processed);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-2", "REF-3"]);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("14"));
}

#[tokio::test]
async fn gmail_error_on_one_message_is_retried_later() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "m1"), ("12", "m2"), ("13", "m3")]).await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&app.google)
        .await;
    for id in ["m1", "m2", "m3"] {
        mount_message(&app.google, id, "Transfer").await;
    }
    for (id, reference) in [("m1", "REF-1"), ("m2", "REF-2"), ("m3", "REF-3")] {
        mount_parse(&app.parser, id, ResponseTemplate::new(200).set_body_json(parsed_transaction(reference))).await;
    }

    let report = app.state.processor.process(&notification("13")).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.cursor, Some(11));
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-3"]);

    mount_history(&app.google, "11", &[("12", "m2"), ("13", "m3")]).await;
    let report = app.state.processor.process(&notification("13")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Processed);
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-2", "REF-3"]);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("13"));
}

#[tokio::test]
async fn permanent_failures_do_not_hold_the_cursor() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "gone"), ("12", "odd"), ("13", "m3")]).await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&app.google)
        .await;
    mount_message(&app.google, "odd", "Unrecognized layout").await;
    mount_message(&app.google, "m3", "Transfer").await;
    mount_parse(&app.parser, "odd", ResponseTemplate::new(422).set_body_string("unsupported template")).await;
    mount_parse(&app.parser, "m3", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-3"))).await;

    let report = app.state.processor.process(&notification("13")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Processed);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| !f.retriable));
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-3"]);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("13"));
}

/// Store whose transaction inserts fail for one reference number.
struct FailingInserts {
    inner: MemoryDb,
    ref_no: &'static str,
    failures_left: Arc<AtomicUsize>,
}

#[async_trait]
impl Store for FailingInserts {
    async fn get_credential(&self, user_id: &str) -> Result<Option<OAuthCredential>, AppError> {
        self.inner.get_credential(user_id).await
    }

    async fn upsert_credential(&self, credential: &OAuthCredential) -> Result<(), AppError> {
        self.inner.upsert_credential(credential).await
    }

    async fn replace_credential_if(
        &self,
        expected_refresh_encrypted: &str,
        credential: &OAuthCredential,
    ) -> Result<bool, AppError> {
        self.inner
            .replace_credential_if(expected_refresh_encrypted, credential)
            .await
    }

    async fn delete_credential(&self, user_id: &str) -> Result<(), AppError> {
        self.inner.delete_credential(user_id).await
    }

    async fn get_watch_state(&self, user_id: &str) -> Result<Option<WatchState>, AppError> {
        self.inner.get_watch_state(user_id).await
    }

    async fn set_watch_state(&self, state: &WatchState) -> Result<(), AppError> {
        self.inner.set_watch_state(state).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.inner.get_user(user_id).await
    }

    async fn find_user_by_mailbox(&self, email: &str) -> Result<Option<String>, AppError> {
        self.inner.find_user_by_mailbox(email).await
    }

    async fn list_wallets(&self, user_id: &str) -> Result<Vec<Wallet>, AppError> {
        self.inner.list_wallets(user_id).await
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<InsertOutcome, AppError> {
        let fail = tx.ref_no == self.ref_no
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(AppError::Database("deadline exceeded".to_string()));
        }
        self.inner.insert_transaction(tx).await
    }
}

#[tokio::test]
async fn storage_failure_is_isolated_and_retried() {
    let failures_left = Arc::new(AtomicUsize::new(1));
    let app = {
        let failures_left = failures_left.clone();
        create_test_app_with_store(move |db| -> Arc<dyn Store> {
            Arc::new(FailingInserts {
                inner: db,
                ref_no: "REF-2",
                failures_left,
            })
        })
        .await
    };
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "m1"), ("12", "m2"), ("13", "m3")]).await;
    for (id, reference) in [("m1", "REF-1"), ("m2", "REF-2"), ("m3", "REF-3")] {
        mount_message(&app.google, id, "Transfer").await;
        mount_parse(&app.parser, id, ResponseTemplate::new(200).set_body_json(parsed_transaction(reference))).await;
    }

    let report = app.state.processor.process(&notification("13")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Incomplete);
    assert_eq!(report.persisted, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].message_id, "m2");
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-3"]);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("11"));
    assert_eq!(failures_left.load(Ordering::SeqCst), 0);

    mount_history(&app.google, "11", &[("12", "m2"), ("13", "m3")]).await;
    let report = app.state.processor.process(&notification("13")).await.unwrap();

    assert_eq!(report.outcome, Outcome::Processed);
    assert_eq!(stored_refs(&app, "user-1"), vec!["REF-1", "REF-2", "REF-3"]);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("13"));
}

#[tokio::test]
async fn watch_renewal_does_not_rewind_a_concurrent_cursor_advance() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_watch(&app.google, "5", 1).await;
    // Slow profile read keeps the renewal in flight while the batch runs.
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/profile"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"emailAddress": EMAIL, "historyId": "5"}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&app.google)
        .await;
    mount_history(&app.google, "10", &[("20", "m1")]).await;
    mount_message(&app.google, "m1", "Transfer").await;
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;

    let renewal = {
        let state = app.state.clone();
        tokio::spawn(async move { state.watch_registrar.renew("user-1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    app.state.processor.process(&notification("20")).await.unwrap();
    renewal.await.unwrap().unwrap();

    let state = app.db.get_watch_state("user-1").await.unwrap().unwrap();
    assert_eq!(state.history_id.as_deref(), Some("20"));
    assert_eq!(state.status, WatchStatus::Watching);
}

#[tokio::test]
async fn non_transaction_emails_are_skipped() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "promo")]).await;
    mount_message(&app.google, "promo", "Big sale this weekend").await;
    mount_parse(&app.parser, "promo", ResponseTemplate::new(200).set_body_json(json!({"transaction": null}))).await;

    let report = app.state.processor.process(&notification("11")).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.persisted, 0);
    assert!(app.db.transactions_for("user-1").is_empty());
}

#[tokio::test]
async fn redelivered_messages_do_not_duplicate_transactions() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    // Two emails about the same bank transfer.
    mount_history(&app.google, "10", &[("11", "m1"), ("12", "m1-copy")]).await;
    mount_message(&app.google, "m1", "Transfer").await;
    mount_message(&app.google, "m1-copy", "Transfer").await;
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;
    mount_parse(&app.parser, "m1-copy", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;

    let report = app.state.processor.process(&notification("12")).await.unwrap();

    assert_eq!(report.persisted, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(app.db.transactions_for("user-1").len(), 1);
}

#[tokio::test]
async fn same_message_in_several_records_is_fetched_once() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    mount_history(&app.google, "10", &[("11", "m1"), ("12", "m1")]).await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "m1",
            "internalDate": "1760000000000",
            "payload": {"headers": [], "body": {}}
        })))
        .expect(1)
        .mount(&app.google)
        .await;
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(json!({"transaction": null}))).await;

    let report = app.state.processor.process(&notification("12")).await.unwrap();
    assert_eq!(report.fetched, 1);
}

#[tokio::test]
async fn history_pages_are_followed() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{"id": "12", "messagesAdded": [{"message": {"id": "m2"}}]}],
            "historyId": "12"
        })))
        .mount(&app.google)
        .await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .and(query_param("startHistoryId", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{"id": "11", "messagesAdded": [{"message": {"id": "m1"}}]}],
            "nextPageToken": "page-2",
            "historyId": "12"
        })))
        .up_to_n_times(1)
        .mount(&app.google)
        .await;

    mount_message(&app.google, "m1", "Transfer").await;
    mount_message(&app.google, "m2", "Transfer").await;
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;
    mount_parse(&app.parser, "m2", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-2"))).await;

    let report = app.state.processor.process(&notification("12")).await.unwrap();
    assert_eq!(report.persisted, 2);
}

#[tokio::test]
async fn matching_wallet_wins_over_default() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;
    app.db.put_wallet(Wallet {
        id: "bca-main".to_string(),
        user_id: "user-1".to_string(),
        bank: "BCA".to_string(),
        account_number: Some("0001231234".to_string()),
    });

    mount_history(&app.google, "10", &[("11", "m1")]).await;
    mount_message(&app.google, "m1", "Transfer").await;
    mount_parse(&app.parser, "m1", ResponseTemplate::new(200).set_body_json(parsed_transaction("REF-1"))).await;

    app.state.processor.process(&notification("11")).await.unwrap();

    let stored = app.db.transactions_for("user-1");
    assert_eq!(stored[0].wallet_id.as_deref(), Some("bca-main"));
    assert_eq!(stored[0].source_message_id, "m1");
}

#[tokio::test]
async fn missing_cursor_is_initialized_without_fetching() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "0").await;
    let mut state = app.db.get_watch_state("user-1").await.unwrap().unwrap();
    state.history_id = None;
    app.db.set_watch_state(&state).await.unwrap();

    Mock::given(path_regex("^/gmail/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&app.google)
        .await;

    let report = app.state.processor.process(&notification("500")).await.unwrap();
    assert_eq!(report.outcome, Outcome::CursorInitialized);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("500"));
}

#[tokio::test]
async fn stale_notification_is_a_no_op() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "100").await;

    Mock::given(path_regex("^/gmail/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&app.google)
        .await;

    for id in ["90", "100"] {
        let report = app.state.processor.process(&notification(id)).await.unwrap();
        assert_eq!(report.outcome, Outcome::AlreadyProcessed);
    }
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("100"));
}

#[tokio::test]
async fn expired_history_moves_cursor_to_notified_id() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": 404, "message": "Requested entity was not found."}
        })))
        .mount(&app.google)
        .await;

    let report = app.state.processor.process(&notification("5000")).await.unwrap();
    assert_eq!(report.outcome, Outcome::HistoryExpired);
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("5000"));
}

#[tokio::test]
async fn gmail_failure_leaves_cursor_for_redelivery() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.google)
        .await;

    let err = app.state.processor.process(&notification("20")).await.unwrap_err();
    assert!(matches!(err, AppError::GoogleApi(_)));
    assert_eq!(cursor_of(&app, "user-1").await.as_deref(), Some("10"));
}

#[tokio::test]
async fn rejected_access_token_is_dropped_from_cache() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&app.google)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(common::token_response("AT-next", None, 3600))
        .expect(0)
        .mount(&app.google)
        .await;

    assert!(app.state.processor.process(&notification("20")).await.is_err());

    // Cache is gone; the stored (still fresh) credential is read again.
    assert_eq!(
        app.state
            .token_manager
            .get_valid_access_token("user-1")
            .await
            .unwrap(),
        "AT-valid"
    );
}

#[tokio::test]
async fn unknown_mailbox_is_ignored() {
    let app = create_test_app().await;

    let report = app
        .state
        .processor
        .process(&Notification {
            email_address: "stranger@example.com".to_string(),
            history_id: "1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::UnknownMailbox);
    assert!(app.google.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn mailbox_lookup_ignores_case() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "100").await;

    let report = app
        .state
        .processor
        .process(&Notification {
            email_address: "Owner@Example.COM".to_string(),
            history_id: "100".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(report.user_id.as_deref(), Some("user-1"));
}

#[tokio::test]
async fn users_needing_reauth_are_skipped() {
    let app = create_test_app().await;
    seed_watched_user(&app, "user-1", EMAIL, "10").await;
    let mut state = app.db.get_watch_state("user-1").await.unwrap().unwrap();
    state.status = WatchStatus::NeedsReauth;
    app.db.set_watch_state(&state).await.unwrap();

    let report = app.state.processor.process(&notification("20")).await.unwrap();
    assert_eq!(report.outcome, Outcome::NeedsReauth);
    assert!(app.google.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_numeric_history_id_is_rejected() {
    let app = create_test_app().await;
    let err = app
        .state
        .processor
        .process(&notification("not-a-number"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

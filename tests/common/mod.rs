// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::Request;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use ojir_mail_ingest::config::Config;
use ojir_mail_ingest::db::{FirestoreDb, MemoryDb, Store};
use ojir_mail_ingest::models::{User, WatchState, WatchStatus};
use ojir_mail_ingest::routes::create_router;
use ojir_mail_ingest::services::{
    GoogleEndpoints, HttpTransactionParser, KmsService, PushVerifier,
};
use ojir_mail_ingest::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PUSH_KID: &str = "test-push-kid";
pub const PUSH_PRIVATE_KEY: &[u8] = include_bytes!("../fixtures/push_signing_key.pem");
pub const PUSH_PUBLIC_KEY: &[u8] = include_bytes!("../fixtures/push_signing_key.pub.pem");
#[allow(dead_code)]
pub const OTHER_PRIVATE_KEY: &[u8] = include_bytes!("../fixtures/other_signing_key.pem");
#[allow(dead_code)]
pub const PUSH_JWKS: &str = include_str!("../fixtures/push_jwks.json");

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection (emulator).
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Offline app wired to in-memory storage, mock KMS and wiremock servers.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub db: MemoryDb,
    /// Stands in for accounts.google.com, oauth2 and the Gmail API
    pub google: MockServer,
    /// Stands in for the email-to-transaction parser
    pub parser: MockServer,
}

/// Create a test app with offline mock dependencies.
#[allow(dead_code)]
pub async fn create_test_app() -> TestApp {
    create_test_app_with_store(|db| -> Arc<dyn Store> { Arc::new(db) }).await
}

/// Like [`create_test_app`], with the services seeing `wrap(db)` as their
/// store while `TestApp::db` still exposes the underlying data.
#[allow(dead_code)]
pub async fn create_test_app_with_store<F>(wrap: F) -> TestApp
where
    F: FnOnce(MemoryDb) -> Arc<dyn Store>,
{
    let google = MockServer::start().await;
    let parser = MockServer::start().await;

    let mut config = Config::test_default();
    config.parser_url = format!("{}/parse", parser.uri());
    config.http_timeout = Duration::from_secs(5);

    let db = MemoryDb::new();
    let push_verifier = PushVerifier::new_with_static_key(
        &config,
        PUSH_KID,
        DecodingKey::from_rsa_pem(PUSH_PUBLIC_KEY).expect("test public key"),
    )
    .expect("push verifier");

    let transaction_parser = Arc::new(
        HttpTransactionParser::new(config.parser_url.clone(), config.http_timeout)
            .expect("parser client"),
    );

    let state = Arc::new(
        AppState::new(
            config,
            wrap(db.clone()),
            KmsService::new_mock(),
            GoogleEndpoints::with_base_url(&google.uri()),
            transaction_parser,
            push_verifier,
        )
        .expect("app state"),
    );

    TestApp {
        router: create_router(state.clone()),
        state,
        db,
        google,
        parser,
    }
}

// ─── Sessions ────────────────────────────────────────────────

#[allow(dead_code)]
pub fn session_token(config: &Config, user_id: &str) -> String {
    ojir_mail_ingest::middleware::auth::create_jwt(user_id, &config.jwt_signing_key)
        .expect("session jwt")
}

#[allow(dead_code)]
pub fn authed_request(config: &Config, user_id: &str, method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(
            "authorization",
            format!("Bearer {}", session_token(config, user_id)),
        )
        .body(Body::empty())
        .unwrap()
}

// ─── Push notifications ──────────────────────────────────────

#[allow(dead_code)]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims Pub/Sub puts in a push token for this deployment.
#[allow(dead_code)]
pub fn push_claims(config: &Config) -> Value {
    let now = now_secs();
    json!({
        "iss": "https://accounts.google.com",
        "aud": config.pubsub_push_audience,
        "sub": "112233445566778899",
        "email": config.pubsub_service_account,
        "email_verified": true,
        "iat": now,
        "exp": now + 3600,
    })
}

#[allow(dead_code)]
pub fn sign_push_token(claims: &Value, kid: &str, private_key: &[u8]) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(private_key).expect("test private key"),
    )
    .expect("push token")
}

#[allow(dead_code)]
pub fn valid_push_token(config: &Config) -> String {
    sign_push_token(&push_claims(config), PUSH_KID, PUSH_PRIVATE_KEY)
}

/// Pub/Sub push envelope around a Gmail notification.
#[allow(dead_code)]
pub fn push_body(email: &str, history_id: &str) -> String {
    let data = json!({"emailAddress": email, "historyId": history_id}).to_string();
    json!({
        "message": {
            "data": STANDARD.encode(data),
            "messageId": "2070443601311540",
            "publishTime": "2026-01-01T00:00:00Z"
        },
        "subscription": "projects/test-project/subscriptions/gmail-push"
    })
    .to_string()
}

#[allow(dead_code)]
pub fn push_request(
    signature: Option<&str>,
    timestamp: Option<&str>,
    body: String,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/gmail")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header("x-goog-signature", sig);
    }
    if let Some(ts) = timestamp {
        builder = builder.header("x-goog-timestamp", ts);
    }
    builder.body(Body::from(body)).unwrap()
}

// ─── Seeding ─────────────────────────────────────────────────

/// A user whose mailbox is watched at `cursor` with a stored credential
/// that is valid for another hour.
#[allow(dead_code)]
pub async fn seed_watched_user(app: &TestApp, user_id: &str, email: &str, cursor: &str) {
    app.db.put_user(User {
        id: user_id.to_string(),
        email: email.to_string(),
        email_verified: true,
        default_wallet_id: Some(format!("{user_id}-wallet")),
    });

    app.state
        .token_manager
        .store_token(user_id, "AT-valid", "RT-valid", 3600, vec![])
        .await
        .unwrap();

    let mut state = WatchState::new(user_id);
    state.email_address = Some(email.to_string());
    state.history_id = Some(cursor.to_string());
    state.status = WatchStatus::Watching;
    app.db.set_watch_state(&state).await.unwrap();
}

// ─── Google mocks ────────────────────────────────────────────

/// Token endpoint answer.
#[allow(dead_code)]
pub fn token_response(access: &str, refresh: Option<&str>, expires_in: i64) -> ResponseTemplate {
    let mut body = json!({
        "access_token": access,
        "expires_in": expires_in,
        "scope": "https://www.googleapis.com/auth/gmail.readonly",
        "token_type": "Bearer"
    });
    if let Some(rt) = refresh {
        body["refresh_token"] = json!(rt);
    }
    ResponseTemplate::new(200).set_body_json(body)
}

#[allow(dead_code)]
pub async fn mount_watch(google: &MockServer, history_id: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/gmail/v1/users/me/watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "historyId": history_id,
            "expiration": "1893456000000"
        })))
        .expect(expected_calls)
        .mount(google)
        .await;
}

#[allow(dead_code)]
pub async fn mount_profile(google: &MockServer, email: &str) {
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": email,
            "messagesTotal": 10,
            "historyId": "1"
        })))
        .mount(google)
        .await;
}

/// `history.list` answering one page with `(history_id, message_id)` records.
#[allow(dead_code)]
pub async fn mount_history(google: &MockServer, start: &str, records: &[(&str, &str)]) {
    let history: Vec<Value> = records
        .iter()
        .map(|(id, msg)| {
            json!({
                "id": id,
                "messagesAdded": [{"message": {"id": msg, "threadId": msg, "labelIds": ["INBOX"]}}]
            })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .and(query_param("startHistoryId", start))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": history,
            "historyId": records.last().map(|r| r.0).unwrap_or(start)
        })))
        .mount(google)
        .await;
}

#[allow(dead_code)]
pub async fn mount_message(google: &MockServer, message_id: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/gmail/v1/users/me/messages/{message_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": message_id,
            "threadId": message_id,
            "internalDate": "1760000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "From", "value": "BCA <notifikasi@bca.co.id>"},
                    {"name": "Subject", "value": "Transfer Berhasil"}
                ],
                "body": {"data": URL_SAFE_NO_PAD.encode(body)}
            }
        })))
        .mount(google)
        .await;
}

/// Parser answer describing an outgoing transfer.
#[allow(dead_code)]
pub fn parsed_transaction(ref_no: &str) -> Value {
    json!({
        "transaction": {
            "recipient": "Toko Maju",
            "amount": 5000000,
            "fee": 250000,
            "totalAmount": 5250000,
            "currency": "IDR",
            "refNo": ref_no,
            "sourceAccount": "xxxx1234",
            "destinationAccount": "9876543210",
            "direction": "out",
            "bank": "bca"
        }
    })
}

/// Poll until `check` holds (background processing), or panic.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Cloud Run injects secrets as environment variables via secret bindings,
//! so everything is read once at startup and kept in memory.

use std::env;
use std::time::Duration;

/// Which storage backend the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Firestore,
    /// Process-local storage for development and tests.
    Memory,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Google OAuth client ID (public)
    pub google_client_id: String,
    /// Redirect URI registered for the authorization callback
    pub google_redirect_uri: String,
    /// Pub/Sub topic Gmail publishes mailbox changes to
    pub gmail_pubsub_topic: String,
    /// Label IDs the watch is restricted to
    pub gmail_watch_labels: Vec<String>,
    /// Expected `aud` claim of push-notification tokens
    pub pubsub_push_audience: String,
    /// Expected `email` claim of push-notification tokens
    pub pubsub_service_account: String,
    /// External email-to-transaction parser endpoint
    pub parser_url: String,
    /// Web app origin (settings page lives under it)
    pub frontend_url: String,
    /// Public URL of this service
    pub api_url: String,
    /// GCP project ID
    pub gcp_project_id: String,
    /// GCP region (KMS key location)
    pub gcp_region: String,
    /// Storage backend
    pub storage_backend: StorageBackend,
    /// Server port
    pub port: u16,
    /// Timeout applied to every outbound HTTP call
    pub http_timeout: Duration,

    // --- Secrets ---
    /// Google OAuth client secret
    pub google_client_secret: String,
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    /// HMAC key for the OAuth state parameter
    pub oauth_state_key: Vec<u8>,
}

impl Config {
    /// Config for tests and local experiments.
    pub fn test_default() -> Self {
        Self {
            google_client_id: "test_client_id".to_string(),
            google_redirect_uri: "http://localhost:8080/auth/google/callback".to_string(),
            gmail_pubsub_topic: "projects/test-project/topics/gmail".to_string(),
            gmail_watch_labels: vec!["INBOX".to_string()],
            pubsub_push_audience: "http://localhost:8080/webhook/gmail".to_string(),
            pubsub_service_account: "gmail-push@test-project.iam.gserviceaccount.com"
                .to_string(),
            parser_url: "http://localhost:9090/parse".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            api_url: "http://localhost:8080".to_string(),
            gcp_project_id: "test-project".to_string(),
            gcp_region: "us-west1".to_string(),
            storage_backend: StorageBackend::Memory,
            port: 8080,
            http_timeout: Duration::from_secs(10),
            google_client_secret: "test_secret".to_string(),
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            oauth_state_key: b"test_oauth_state_key".to_vec(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// A `.env` file is honoured for local development.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_url = env::var("API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| "http://localhost:8080".to_string());

        let storage_backend = match env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            Ok("firestore") | Err(_) => StorageBackend::Firestore,
            Ok(_) => return Err(ConfigError::Invalid("STORAGE_BACKEND")),
        };

        Ok(Self {
            google_client_id: required("GOOGLE_CLIENT_ID")?,
            google_redirect_uri: env::var("GOOGLE_REDIRECT_URI")
                .unwrap_or_else(|_| format!("{}/auth/google/callback", api_url)),
            gmail_pubsub_topic: required("GMAIL_PUBSUB_TOPIC")?,
            gmail_watch_labels: parse_labels(
                &env::var("GMAIL_WATCH_LABELS").unwrap_or_else(|_| "INBOX".to_string()),
            ),
            pubsub_push_audience: env::var("PUBSUB_PUSH_AUDIENCE")
                .unwrap_or_else(|_| format!("{}/webhook/gmail", api_url)),
            pubsub_service_account: required("PUBSUB_SERVICE_ACCOUNT")?,
            parser_url: required("PARSER_URL")?,
            frontend_url: env::var("FRONTEND_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            gcp_region: env::var("GCP_REGION").unwrap_or_else(|_| "us-west1".to_string()),
            storage_backend,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            http_timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            api_url,

            google_client_secret: required("GOOGLE_CLIENT_SECRET")?,
            jwt_signing_key: required("JWT_SIGNING_KEY")?.into_bytes(),
            oauth_state_key: required("OAUTH_STATE_KEY")?.into_bytes(),
        })
    }

    /// Settings page the authorization callback redirects back to.
    pub fn settings_url(&self) -> String {
        format!("{}/settings", self.frontend_url)
    }
}

/// Read a required variable, trimming stray whitespace from secret bindings.
fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_labels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

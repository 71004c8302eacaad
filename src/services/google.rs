// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google API client for OAuth and Gmail.
//!
//! Handles:
//! - Authorization code exchange and token refresh
//! - Token revocation
//! - Gmail watch/stop (push subscription)
//! - Mailbox history listing and message fetching
//!
//! All calls are bounded by the client timeout.

use crate::error::AppError;
use crate::models::MailMessage;
use crate::time_utils::from_epoch_millis;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scope needed to watch the mailbox and read notification emails.
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Base URLs of the Google endpoints we call.
///
/// Overridable so tests can point the client at a mock server.
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    /// Gmail API root for the authorized user (`.../gmail/v1/users/me`)
    pub gmail_url: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            gmail_url: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// All endpoints rooted at one base URL (mock servers).
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            auth_url: format!("{}/o/oauth2/v2/auth", base),
            token_url: format!("{}/token", base),
            revoke_url: format!("{}/revoke", base),
            gmail_url: format!("{}/gmail/v1/users/me", base),
        }
    }
}

/// Google API client.
#[derive(Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    endpoints: GoogleEndpoints,
    client_id: String,
    client_secret: String,
}

impl GoogleClient {
    /// Create a new Google client with OAuth credentials.
    pub fn new(
        client_id: String,
        client_secret: String,
        endpoints: GoogleEndpoints,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            endpoints,
            client_id,
            client_secret,
        })
    }

    // ─── OAuth ───────────────────────────────────────────────────────────────

    /// Consent-screen URL requesting offline Gmail read access.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&\
             access_type=offline&prompt=consent&include_granted_scopes=true&state={}",
            self.endpoints.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(GMAIL_READONLY_SCOPE),
            urlencoding::encode(state),
        )
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AppError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(format!("Token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Google token exchange failed");
            return Err(AppError::GoogleApi(format!(
                "Token exchange failed with status {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::GoogleApi(format!("Failed to parse token response: {}", e)))
    }

    /// Mint a new access token from a refresh token.
    ///
    /// A revoked or expired grant maps to [`AppError::RefreshFailed`].
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, AppError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                AppError::GoogleApi(format!("Failed to parse refresh response: {}", e))
            });
        }

        let body = response.text().await.unwrap_or_default();
        let oauth_error: Option<OAuthErrorBody> = serde_json::from_str(&body).ok();

        match oauth_error {
            Some(err) if is_revoked_grant(&err.error) => Err(AppError::RefreshFailed(
                err.error_description.unwrap_or(err.error),
            )),
            // invalid_client and friends are our configuration, not the user's grant.
            _ => {
                tracing::error!(status = %status, body = %body, "Google token refresh failed");
                Err(AppError::GoogleApi(format!("HTTP {}: {}", status, body)))
            }
        }
    }

    /// Revoke a token (and with it the whole grant).
    pub async fn revoke(&self, token: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(&self.endpoints.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(format!("Revocation request failed: {}", e)))?;

        self.check_response(response).await
    }

    // ─── Gmail ───────────────────────────────────────────────────────────────

    /// Subscribe the mailbox to push notifications on `topic`.
    ///
    /// Re-registering renews an existing subscription.
    pub async fn watch(
        &self,
        access_token: &str,
        topic: &str,
        label_ids: &[String],
    ) -> Result<WatchResponse, AppError> {
        let url = format!("{}/watch", self.endpoints.gmail_url);
        let body = WatchRequest {
            topic_name: topic,
            label_ids,
            label_filter_behavior: "include",
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::WatchRegistration(format!("Watch request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::WatchRegistration(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::WatchRegistration(format!("Invalid watch response: {}", e)))
    }

    /// Cancel push notifications for the mailbox.
    pub async fn stop(&self, access_token: &str) -> Result<(), AppError> {
        let url = format!("{}/stop", self.endpoints.gmail_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(e.to_string()))?;

        self.check_response(response).await
    }

    /// Mailbox address and current history ID.
    pub async fn get_profile(&self, access_token: &str) -> Result<GmailProfile, AppError> {
        let url = format!("{}/profile", self.endpoints.gmail_url);
        self.get_json(&url, access_token, &[]).await
    }

    /// One page of added-message history after `start_history_id`.
    pub async fn list_history(
        &self,
        access_token: &str,
        start_history_id: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, AppError> {
        let url = format!("{}/history", self.endpoints.gmail_url);

        let mut query = vec![
            ("startHistoryId", start_history_id.to_string()),
            ("historyTypes", "messageAdded".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(e.to_string()))?;

        // Gmail answers 404 when the start cursor is older than it retains.
        if response.status().as_u16() == 404 {
            return Err(AppError::GoogleApi(AppError::HISTORY_EXPIRED.to_string()));
        }

        self.check_response_json(response).await
    }

    /// Fetch a full message and reduce it to parser input.
    ///
    /// A message deleted since the notification maps to
    /// [`AppError::NotFound`].
    pub async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<MailMessage, AppError> {
        let url = format!(
            "{}/messages/{}",
            self.endpoints.gmail_url,
            urlencoding::encode(message_id)
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(AppError::NotFound(format!("Gmail message {}", message_id)));
        }

        let raw: RawMessage = self.check_response_json(response).await?;
        Ok(raw.into_mail_message())
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    /// Generic GET request with JSON response.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::GoogleApi(e.to_string()))?;

        self.check_response_json(response).await
    }

    /// Check response status and return error if not successful.
    async fn check_response(&self, response: reqwest::Response) -> Result<(), AppError> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::status_error(response).await)
    }

    /// Check response and parse JSON body.
    async fn check_response_json<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, AppError> {
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| AppError::GoogleApi(format!("JSON parse error: {}", e)))
    }

    async fn status_error(response: reqwest::Response) -> AppError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            429 => {
                tracing::warn!("Google rate limit hit (429)");
                AppError::GoogleApi(AppError::GOOGLE_RATE_LIMIT.to_string())
            }
            401 => AppError::GoogleApi(AppError::GOOGLE_TOKEN_ERROR.to_string()),
            _ => AppError::GoogleApi(format!("HTTP {}: {}", status, body)),
        }
    }
}

fn is_revoked_grant(error: &str) -> bool {
    error == "invalid_grant"
}

/// Token endpoint response (code exchange and refresh).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Only present on the first exchange or when Google rotates it.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Granted scopes as a list.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn no_labels(labels: &&[String]) -> bool {
    labels.is_empty()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    topic_name: &'a str,
    #[serde(skip_serializing_if = "no_labels")]
    label_ids: &'a [String],
    label_filter_behavior: &'a str,
}

/// Response of `users.watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub history_id: String,
    /// Epoch milliseconds when the watch lapses
    #[serde(default)]
    pub expiration: Option<String>,
}

/// Response of `users.getProfile`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailProfile {
    pub email_address: String,
    #[serde(default)]
    pub history_id: Option<String>,
}

/// Response of `users.history.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
}

/// One mailbox change.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// History ID of this change
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<RawHeader>,
    #[serde(default)]
    body: Option<RawBody>,
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    #[serde(default)]
    data: Option<String>,
}

impl RawMessage {
    fn into_mail_message(self) -> MailMessage {
        let payload = self.payload.unwrap_or_default();

        let received_at = self
            .internal_date
            .as_deref()
            .and_then(from_epoch_millis)
            .unwrap_or_else(Utc::now);

        let body = find_part(&payload, "text/plain")
            .or_else(|| find_part(&payload, "text/html"))
            .unwrap_or_default();

        MailMessage {
            id: self.id,
            thread_id: self.thread_id,
            from: find_header(&payload.headers, "From").unwrap_or_default(),
            subject: find_header(&payload.headers, "Subject").unwrap_or_default(),
            body,
            received_at,
        }
    }
}

/// Find a header value by name (case-insensitive).
fn find_header(headers: &[RawHeader], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Depth-first search for the first part of `mime_type` with a body.
fn find_part(part: &RawPart, mime_type: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime_type) {
        if let Some(text) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_base64url)
        {
            return Some(text);
        }
    }
    part.parts.iter().find_map(|p| find_part(p, mime_type))
}

/// Gmail bodies are base64url; some senders pad them.
///
/// Bodies in legacy charsets (often ISO-8859-1 from banks) are decoded
/// lossily so the readable ASCII still reaches the parser.
fn decode_base64url(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(
                valid_up_to = e.utf8_error().valid_up_to(),
                "Message body is not UTF-8, decoding lossily"
            );
            Some(String::from_utf8_lossy(e.as_bytes()).into_owned())
        }
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Client for the external email-to-transaction parser.

use crate::error::AppError;
use crate::models::{MailMessage, ParsedTransaction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Turns a bank notification email into at most one transaction.
#[async_trait]
pub trait TransactionParser: Send + Sync {
    /// `Ok(None)` means the message is not a transaction notification.
    async fn parse(&self, message: &MailMessage) -> Result<Option<ParsedTransaction>, AppError>;
}

/// Parser reached over HTTP.
///
/// `POST {parser_url}` with the message as JSON; the service answers
/// `{"transaction": null | {...}}`.
#[derive(Clone)]
pub struct HttpTransactionParser {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParseRequest<'a> {
    message_id: &'a str,
    from: &'a str,
    subject: &'a str,
    body: &'a str,
    received_at: String,
}

#[derive(Deserialize)]
struct ParseResponse {
    transaction: Option<ParsedTransaction>,
}

impl HttpTransactionParser {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to build parser client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TransactionParser for HttpTransactionParser {
    async fn parse(&self, message: &MailMessage) -> Result<Option<ParsedTransaction>, AppError> {
        let request = ParseRequest {
            message_id: &message.id,
            from: &message.from,
            subject: &message.subject,
            body: &message.body,
            received_at: message.received_at.to_rfc3339(),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::ParserUnavailable(format!("Parser request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AppError::ParserUnavailable(format!("Parser returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Parse(format!(
                "Parser returned {}: {}",
                status, body
            )));
        }

        let parsed: ParseResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("Invalid parser response: {}", e)))?;

        if let Some(tx) = &parsed.transaction {
            if tx.ref_no.trim().is_empty() || tx.bank.trim().is_empty() {
                return Err(AppError::Parse(
                    "Parser result lacks bank or reference number".to_string(),
                ));
            }
        }

        Ok(parsed.transaction)
    }
}

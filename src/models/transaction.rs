// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Transactions created from bank notification emails.

use serde::{Deserialize, Serialize};

/// Money flow relative to the user's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Structured output of the external email parser.
///
/// Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub recipient: String,
    pub amount: i64,
    #[serde(default)]
    pub fee: i64,
    pub total_amount: i64,
    pub currency: String,
    /// Bank-issued transaction reference number
    pub ref_no: String,
    #[serde(default)]
    pub source_account: Option<String>,
    #[serde(default)]
    pub destination_account: Option<String>,
    pub direction: Direction,
    /// Source bank tag (e.g. "bca", "mandiri")
    pub bank: String,
}

impl ParsedTransaction {
    /// Key that identifies the underlying bank transaction.
    ///
    /// Re-processing the same email yields the same key.
    pub fn idempotency_key(&self) -> String {
        // Firestore document IDs cannot contain '/'.
        format!(
            "{}:{}",
            self.bank.trim().to_lowercase(),
            self.ref_no.trim().replace('/', "_")
        )
    }

    /// The account on the user's side of the transfer.
    pub fn own_account(&self) -> Option<&str> {
        match self.direction {
            Direction::Out => self.source_account.as_deref(),
            Direction::In => self.destination_account.as_deref(),
        }
    }
}

/// Stored transaction record in Firestore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// `<user_id>:<idempotency key>` (also used as document ID)
    pub id: String,
    pub user_id: String,
    /// Wallet the transaction was booked to, if any matched
    pub wallet_id: Option<String>,
    /// Gmail message the transaction was parsed from
    pub source_message_id: String,
    pub recipient: String,
    pub amount: i64,
    pub fee: i64,
    pub total_amount: i64,
    pub currency: String,
    pub ref_no: String,
    pub source_account: Option<String>,
    pub destination_account: Option<String>,
    pub direction: Direction,
    pub bank: String,
    /// When the email was received (RFC3339)
    pub occurred_at: String,
    /// When this record was created (RFC3339)
    pub created_at: String,
}

impl Transaction {
    pub fn from_parsed(
        parsed: ParsedTransaction,
        user_id: &str,
        wallet_id: Option<String>,
        source_message_id: &str,
        occurred_at: String,
        created_at: String,
    ) -> Self {
        Self {
            id: format!("{}:{}", user_id, parsed.idempotency_key()),
            user_id: user_id.to_string(),
            wallet_id,
            source_message_id: source_message_id.to_string(),
            recipient: parsed.recipient,
            amount: parsed.amount,
            fee: parsed.fee,
            total_amount: parsed.total_amount,
            currency: parsed.currency,
            ref_no: parsed.ref_no,
            source_account: parsed.source_account,
            destination_account: parsed.destination_account,
            direction: parsed.direction,
            bank: parsed.bank,
            occurred_at,
            created_at,
        }
    }
}

/// A user's bank wallet, used to route parsed transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    /// Bank tag matching `ParsedTransaction::bank`
    pub bank: String,
    /// Account number as printed in notifications (may be masked)
    #[serde(default)]
    pub account_number: Option<String>,
}

impl Wallet {
    /// Whether this wallet is the user's side of `tx`.
    ///
    /// Banks mask account numbers (`xxxx1234`), so a masked account matches
    /// on its visible suffix.
    pub fn matches(&self, tx: &ParsedTransaction) -> bool {
        if !self.bank.eq_ignore_ascii_case(tx.bank.trim()) {
            return false;
        }
        match (self.account_number.as_deref(), tx.own_account()) {
            (Some(ours), Some(theirs)) => {
                let visible = theirs.trim_start_matches(|c: char| !c.is_ascii_digit());
                !visible.is_empty() && ours.ends_with(visible)
            }
            _ => false,
        }
    }
}

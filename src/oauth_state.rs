// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Signed OAuth `state` parameter.
//!
//! Format (before URL-safe base64): `user_id|timestamp_hex|signature_hex`,
//! where the signature is HMAC-SHA256 over `user_id|timestamp_hex`.

use crate::error::AppError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// How long a consent round-trip may take.
const STATE_TTL_MILLIS: u128 = 60 * 60 * 1000;

/// Build a signed state carrying `user_id`.
pub fn sign(user_id: &str, secret: &[u8]) -> Result<String, AppError> {
    sign_at(user_id, secret, now_millis()?)
}

/// Verify a state and return the user ID it carries.
///
/// Returns `None` for malformed, tampered or expired states.
pub fn verify(state: &str, secret: &[u8]) -> Option<String> {
    verify_at(state, secret, now_millis().ok()?)
}

fn sign_at(user_id: &str, secret: &[u8], now_ms: u128) -> Result<String, AppError> {
    let payload = format!("{}|{:x}", user_id, now_ms);
    let signature = mac(&payload, secret)?;
    Ok(URL_SAFE_NO_PAD.encode(format!("{}|{}", payload, hex::encode(signature))))
}

fn verify_at(state: &str, secret: &[u8], now_ms: u128) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(state).ok()?;
    let state_str = String::from_utf8(bytes).ok()?;

    // Split from the right so a '|' inside the user ID stays intact.
    let mut parts = state_str.rsplitn(3, '|');
    let signature_hex = parts.next()?;
    let timestamp_hex = parts.next()?;
    let user_id = parts.next()?;

    if user_id.is_empty() {
        return None;
    }

    let provided = hex::decode(signature_hex).ok()?;
    let expected = mac(&format!("{}|{}", user_id, timestamp_hex), secret).ok()?;

    if !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
        tracing::error!("OAuth state signature mismatch! Potential tampering.");
        return None;
    }

    let issued_ms = u128::from_str_radix(timestamp_hex, 16).ok()?;
    if issued_ms > now_ms || now_ms - issued_ms > STATE_TTL_MILLIS {
        tracing::warn!("OAuth state expired");
        return None;
    }

    Some(user_id.to_string())
}

fn mac(payload: &str, secret: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn now_millis() -> Result<u128, AppError> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("System time error: {}", e)))?
        .as_millis())
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Authenticity checks for Gmail push notifications delivered by Pub/Sub.
//!
//! A delivery carries a Google-signed JWS in `x-goog-signature` and a unix
//! timestamp in `x-goog-timestamp`. The JWS is verified against Google's
//! published key set, which is fetched and cached with the TTL Google
//! advertises.

use crate::config::Config;
use anyhow::Context;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};

pub const SIGNATURE_HEADER: &str = "x-goog-signature";
pub const TIMESTAMP_HEADER: &str = "x-goog-timestamp";

const DISCOVERY_URL: &str = "https://accounts.google.com/.well-known/openid-configuration";
const DEFAULT_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const CLOCK_SKEW_SECS: u64 = 60;
/// Accepted distance between `x-goog-timestamp` and now.
const TIMESTAMP_WINDOW_SECS: u64 = 300;

/// Sender identity extracted from a verified push token.
#[derive(Debug, Clone)]
pub struct VerifiedPushSender {
    pub email: String,
    pub subject: String,
}

/// Push verification error categories.
#[derive(Debug, Clone)]
pub enum PushAuthError {
    /// Headers missing, token invalid, or claims do not match.
    Forbidden(String),
    /// Key set could not be fetched; the provider should retry.
    Transient(String),
}

impl std::fmt::Display for PushAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushAuthError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            PushAuthError::Transient(msg) => write!(f, "transient: {msg}"),
        }
    }
}

#[derive(Clone)]
enum VerifierMode {
    /// Discover the JWKS location from Google's OpenID configuration.
    Google,
    /// Fetch keys from a fixed JWKS URL.
    FixedJwks(String),
    StaticKey {
        kid: String,
        decoding_key: Arc<DecodingKey>,
    },
}

#[derive(Clone)]
struct DiscoveryCacheEntry {
    jwks_uri: String,
    expires_at: Instant,
}

#[derive(Clone)]
struct JwksCacheEntry {
    keys_by_kid: HashMap<String, Arc<DecodingKey>>,
    expires_at: Instant,
}

/// Verifier for Pub/Sub push deliveries.
pub struct PushVerifier {
    http_client: reqwest::Client,
    expected_audience: String,
    expected_service_account_email: String,
    mode: VerifierMode,
    discovery_cache: RwLock<Option<DiscoveryCacheEntry>>,
    jwks_cache: RwLock<Option<JwksCacheEntry>>,
    refresh_lock: Mutex<()>,
}

impl PushVerifier {
    /// Production verifier that discovers and caches Google's JWKS.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let verifier = Self::with_mode(config, VerifierMode::Google)?;

        tracing::info!(
            expected_audience = %verifier.expected_audience,
            expected_service_account_email = %verifier.expected_service_account_email,
            "Initialized push notification verifier"
        );

        Ok(verifier)
    }

    /// Verifier that loads keys from a fixed JWKS URL, skipping discovery.
    pub fn new_with_jwks_url(config: &Config, jwks_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_mode(config, VerifierMode::FixedJwks(jwks_url.into()))
    }

    /// Verifier with a static RSA public key, for deterministic tests.
    pub fn new_with_static_key(
        config: &Config,
        kid: impl Into<String>,
        decoding_key: DecodingKey,
    ) -> anyhow::Result<Self> {
        let kid = kid.into();
        if kid.trim().is_empty() {
            anyhow::bail!("static push kid must not be empty");
        }

        Self::with_mode(
            config,
            VerifierMode::StaticKey {
                kid,
                decoding_key: Arc::new(decoding_key),
            },
        )
    }

    fn with_mode(config: &Config, mode: VerifierMode) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .context("failed building push verifier HTTP client")?;

        Ok(Self {
            http_client,
            expected_audience: canonicalize_audience(&config.pubsub_push_audience),
            expected_service_account_email: config.pubsub_service_account.clone(),
            mode,
            discovery_cache: RwLock::new(None),
            jwks_cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verify the signature and timestamp headers of a push delivery.
    ///
    /// Both headers must be present before any key material is consulted.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<VerifiedPushSender, PushAuthError> {
        let token = header_str(headers, SIGNATURE_HEADER)?;
        let timestamp = header_str(headers, TIMESTAMP_HEADER)?;

        validate_timestamp(timestamp, now_unix_secs())?;

        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(PushAuthError::Forbidden("signature is empty".to_string()));
        }

        self.verify_token(token).await
    }

    async fn verify_token(&self, token: &str) -> Result<VerifiedPushSender, PushAuthError> {
        let header = decode_header(token)
            .map_err(|e| PushAuthError::Forbidden(format!("invalid JWT header: {e}")))?;

        if header.alg != Algorithm::RS256 {
            return Err(PushAuthError::Forbidden(format!(
                "unexpected JWT alg: {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| PushAuthError::Forbidden("missing JWT kid".to_string()))?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&["https://accounts.google.com", "accounts.google.com"]);
        validation.set_audience(&[self.expected_audience.as_str()]);
        validation.validate_nbf = true;
        validation.leeway = CLOCK_SKEW_SECS;

        let claims = decode::<PushTokenClaims>(token, decoding_key.as_ref(), &validation)
            .map_err(|e| PushAuthError::Forbidden(format!("JWT validation failed: {e}")))?
            .claims;

        tracing::debug!(
            email = claims.email.as_deref().unwrap_or("<missing>"),
            subject = %claims.sub,
            exp = claims.exp,
            "Push token claims"
        );

        validate_iat(claims.iat)?;

        let email = claims
            .email
            .ok_or_else(|| PushAuthError::Forbidden("missing email claim".to_string()))?;

        if email != self.expected_service_account_email {
            return Err(PushAuthError::Forbidden(format!(
                "unexpected service account email: {email}"
            )));
        }

        if claims.email_verified != Some(true) {
            return Err(PushAuthError::Forbidden(
                "email_verified claim is not true".to_string(),
            ));
        }

        Ok(VerifiedPushSender {
            email,
            subject: claims.sub,
        })
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<Arc<DecodingKey>, PushAuthError> {
        if let VerifierMode::StaticKey {
            kid: static_kid,
            decoding_key,
        } = &self.mode
        {
            if kid == static_kid {
                return Ok(decoding_key.clone());
            }
            return Err(PushAuthError::Forbidden(format!(
                "unknown JWT kid for static verifier: {kid}"
            )));
        }

        if let Some(key) = self.lookup_cached_key(kid).await {
            return Ok(key);
        }

        // Google rotates keys; an unknown kid earns one forced refresh.
        for force_refresh in [false, true] {
            self.refresh_jwks(force_refresh).await?;
            if let Some(key) = self.lookup_cached_key(kid).await {
                return Ok(key);
            }
        }

        Err(PushAuthError::Forbidden(format!(
            "JWT kid not found in JWKS after refresh: {kid}"
        )))
    }

    async fn lookup_cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        let cache = self.jwks_cache.read().await;
        let now = Instant::now();
        cache
            .as_ref()
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| entry.keys_by_kid.get(kid))
            .cloned()
    }

    async fn refresh_jwks(&self, force_refresh: bool) -> Result<(), PushAuthError> {
        let _guard = self.refresh_lock.lock().await;

        if !force_refresh {
            let cache = self.jwks_cache.read().await;
            if cache
                .as_ref()
                .is_some_and(|entry| entry.expires_at > Instant::now())
            {
                return Ok(());
            }
        }

        let jwks_uri = match &self.mode {
            VerifierMode::FixedJwks(url) => url.clone(),
            _ => self.resolve_jwks_uri(force_refresh).await,
        };

        tracing::debug!(jwks_uri = %jwks_uri, "Refreshing Google JWKS cache");

        let response = self
            .http_client
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|e| PushAuthError::Transient(format!("JWKS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PushAuthError::Transient(format!(
                "JWKS request returned status {}",
                response.status()
            )));
        }

        let ttl = cache_ttl_from_headers(response.headers(), DEFAULT_CACHE_TTL);

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| PushAuthError::Transient(format!("invalid JWKS JSON: {e}")))?;

        let keys_by_kid = usable_keys(jwks);

        if keys_by_kid.is_empty() {
            return Err(PushAuthError::Transient(
                "JWKS response did not include any usable RSA keys".to_string(),
            ));
        }

        *self.jwks_cache.write().await = Some(JwksCacheEntry {
            keys_by_kid,
            expires_at: Instant::now() + ttl,
        });

        tracing::debug!(ttl_secs = ttl.as_secs(), "Google JWKS cache refreshed");
        Ok(())
    }

    /// Falls back to the last known (or default) JWKS URI when discovery
    /// is unavailable.
    async fn resolve_jwks_uri(&self, force_refresh: bool) -> String {
        let cached = self.discovery_cache.read().await.clone();

        if !force_refresh {
            if let Some(entry) = cached.as_ref().filter(|e| e.expires_at > Instant::now()) {
                return entry.jwks_uri.clone();
            }
        }

        let fallback = || {
            cached
                .as_ref()
                .map(|entry| entry.jwks_uri.clone())
                .unwrap_or_else(|| DEFAULT_JWKS_URL.to_string())
        };

        let resp = match self.http_client.get(DISCOVERY_URL).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "OIDC discovery failed; using fallback JWKS URI");
                return fallback();
            }
            Err(e) => {
                tracing::warn!(error = %e, "OIDC discovery request failed; using fallback JWKS URI");
                return fallback();
            }
        };

        let ttl = cache_ttl_from_headers(resp.headers(), DEFAULT_CACHE_TTL);
        match resp.json::<OpenIdConfig>().await {
            Ok(discovery) => {
                *self.discovery_cache.write().await = Some(DiscoveryCacheEntry {
                    jwks_uri: discovery.jwks_uri.clone(),
                    expires_at: Instant::now() + ttl,
                });
                discovery.jwks_uri
            }
            Err(e) => {
                tracing::warn!(error = %e, "Invalid OIDC discovery document; using fallback JWKS URI");
                fallback()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdConfig {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    alg: Option<String>,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
    #[serde(rename = "use")]
    use_: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushTokenClaims {
    sub: String,
    exp: usize,
    iat: Option<usize>,
    email: Option<String>,
    email_verified: Option<bool>,
}

fn usable_keys(jwks: Jwks) -> HashMap<String, Arc<DecodingKey>> {
    let mut keys_by_kid = HashMap::new();

    for jwk in jwks.keys {
        if jwk.kty != "RSA" || jwk.kid.trim().is_empty() {
            continue;
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
            continue;
        }
        if jwk.use_.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }

        match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
            Ok(key) => {
                keys_by_kid.insert(jwk.kid, Arc::new(key));
            }
            Err(e) => {
                tracing::warn!(error = %e, kid = %jwk.kid, "Skipping invalid RSA JWKS key");
            }
        }
    }

    keys_by_kid
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, PushAuthError> {
    let value = headers
        .get(name)
        .ok_or_else(|| PushAuthError::Forbidden(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| PushAuthError::Forbidden(format!("invalid {name} header")))?
        .trim();

    if value.is_empty() {
        return Err(PushAuthError::Forbidden(format!("empty {name} header")));
    }

    Ok(value)
}

fn validate_timestamp(raw: &str, now: u64) -> Result<(), PushAuthError> {
    let ts: u64 = raw
        .parse()
        .map_err(|_| PushAuthError::Forbidden("timestamp is not unix seconds".to_string()))?;

    if ts.abs_diff(now) > TIMESTAMP_WINDOW_SECS {
        return Err(PushAuthError::Forbidden(
            "timestamp outside the accepted window".to_string(),
        ));
    }

    Ok(())
}

fn validate_iat(iat: Option<usize>) -> Result<(), PushAuthError> {
    let Some(iat) = iat else {
        return Err(PushAuthError::Forbidden("missing iat claim".to_string()));
    };

    if iat as u64 > now_unix_secs() + CLOCK_SKEW_SECS {
        return Err(PushAuthError::Forbidden(
            "iat claim is in the future".to_string(),
        ));
    }

    Ok(())
}

fn cache_ttl_from_headers(headers: &reqwest::header::HeaderMap, fallback: Duration) -> Duration {
    headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_cache_control_max_age)
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn parse_cache_control_max_age(value: &str) -> Option<u64> {
    value
        .split(',')
        .filter_map(|d| d.trim().strip_prefix("max-age="))
        .find_map(|raw| raw.trim_matches('"').parse::<u64>().ok())
}

fn canonicalize_audience(audience: &str) -> String {
    audience.trim_end_matches('/').to_string()
}

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

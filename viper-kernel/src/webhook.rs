//! Webhook entrant de la source : payload signé HMAC-SHA256.
//!
//! Signature = hex(HMAC-SHA256(secret, corps ‖ timestamp)), transmise dans
//! `X-Webhook-Signature`, le timestamp dans `X-Webhook-Timestamp` (secondes Unix
//! ou RFC3339). Un timestamp hors tolérance est refusé.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::lifecycle::parse_timestamp;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("webhook secret not configured")]
    MissingSecret,
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("malformed signature or timestamp")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp outside tolerance")]
    Expired,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub verified_count: Option<u64>,
}

pub fn sign(secret: &str, body: &[u8], timestamp: &str) -> Result<String, SignatureError> {
    let mac = mac_for(secret, body, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn mac_for(secret: &str, body: &[u8], timestamp: &str) -> Result<HmacSha256, SignatureError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MissingSecret)?;
    mac.update(body);
    mac.update(timestamp.as_bytes());
    Ok(mac)
}

/// Comparaison en temps constant.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    timestamp: &str,
    signature_hex: &str,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    let expected = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::Malformed)?;
    mac_for(secret, body, timestamp)?
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

pub fn parse_webhook_time(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        let secs = raw.parse::<i64>().ok()?;
        return OffsetDateTime::from_unix_timestamp(secs).ok();
    }
    parse_timestamp(raw)
}

pub fn check_freshness(
    timestamp: &str,
    now: OffsetDateTime,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let sent_at = parse_webhook_time(timestamp).ok_or(SignatureError::Malformed)?;
    if (now - sent_at).whole_seconds().abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }
    Ok(())
}

/// Vérification complète d'une requête webhook.
pub fn authenticate(
    secret: Option<&str>,
    body: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    now: OffsetDateTime,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let secret = secret.filter(|s| !s.is_empty()).ok_or(SignatureError::MissingSecret)?;
    let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
    let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
    check_freshness(timestamp, now, tolerance_secs)?;
    verify_signature(secret, body, timestamp, signature)
}

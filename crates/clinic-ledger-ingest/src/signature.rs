//! Stripe webhook signature verification.
//!
//! The `Stripe-Signature` header carries `t=<unix seconds>` and one or more
//! `v1=<hex>` signatures, each an HMAC-SHA256 over `"{t}.{payload}"`.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::{IngestError, IngestResult};

type HmacSha256 = Hmac<Sha256>;

/// Stripe's default replay window, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> IngestResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(IngestError::MalformedHeader(format!("bad element '{}'", part)));
        };
        match key {
            "t" => {
                let t = value
                    .parse::<i64>()
                    .map_err(|_| IngestError::MalformedHeader(format!("bad timestamp '{}'", value)))?;
                timestamp = Some(t);
            }
            "v1" => {
                let bytes = hex::decode(value)
                    .map_err(|_| IngestError::MalformedHeader("signature is not hex".into()))?;
                signatures.push(bytes);
            }
            // Other schemes (v0) are ignored
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| IngestError::MalformedHeader("no timestamp".into()))?;
    if signatures.is_empty() {
        return Err(IngestError::MalformedHeader("no v1 signature".into()));
    }
    Ok(SignatureHeader { timestamp, signatures })
}

fn mac_for(secret: &str, timestamp: i64, payload: &str) -> IngestResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| crate::invalid("secret", e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Verify a webhook delivery.
///
/// Any one matching `v1` signature is accepted; comparison is constant time.
/// The timestamp must be within `tolerance` of `now` in either direction.
pub fn verify_stripe_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> IngestResult<()> {
    let parsed = parse_header(header)?;

    let mac = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed
        .signatures
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok());
    if !matched {
        warn!(timestamp = parsed.timestamp, "Webhook signature mismatch");
        return Err(IngestError::SignatureMismatch);
    }

    let age = now.timestamp() - parsed.timestamp;
    if age.abs() > tolerance.num_seconds() {
        warn!(timestamp = parsed.timestamp, age, "Webhook timestamp outside tolerance");
        return Err(IngestError::TimestampOutOfTolerance {
            timestamp: parsed.timestamp,
        });
    }
    Ok(())
}

/// Build a `Stripe-Signature` header value for a payload.
pub fn sign_stripe_payload(payload: &str, secret: &str, timestamp: i64) -> IngestResult<String> {
    let signature = mac_for(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

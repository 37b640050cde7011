//! Access token introspection
//!
//! The client never verifies signatures; it only reads the `exp` claim to
//! know when to refresh. Anything that does not look like a three-part token
//! with a numeric `exp` decodes to `None`.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Read the expiry instant from a token's payload
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.splitn(3, '.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    parts.next()?;

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    let exp = match claims.get("exp")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };

    Utc.timestamp_opt(exp, 0).single()
}

/// How long to wait before refreshing a token that expires at `expires_at`.
///
/// The refresh is due `lead` before expiry; a token already inside its lead
/// window is due immediately. Expiries at the edge of the representable
/// range never overflow: one too early to subtract the lead from is due now.
pub fn refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, lead: Duration) -> Duration {
    let lead = chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero());
    expires_at
        .checked_sub_signed(lead)
        .and_then(|due| due.signed_duration_since(now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Whether the token can be scheduled at all
pub fn is_decodable(token: &str) -> bool {
    decode_expiry(token).is_some()
}

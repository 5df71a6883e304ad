//! Shared error classification for the voice bridge.
//!
//! External collaborators (carrier, AI providers, calendar, SMS) all speak
//! HTTP or WebSocket close codes. This module turns their raw error text
//! into the abstract kinds the rest of the crate reasons about, mirroring
//! the classify-then-decide pattern used for LLM failover.

use std::time::Duration;
use thiserror::Error;

/// Abstract error classification shared by every external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Worth retrying with backoff: connection resets, 5xx, 429.
    #[error("transient_network")]
    TransientNetwork { retry_after: Option<Duration> },
    /// 401/403 or equivalent. Fatal for the call site.
    #[error("authentication")]
    Authentication,
    /// The referenced resource does not exist (booking uid, contact).
    #[error("not_found")]
    NotFound,
    /// Caller-supplied data was malformed (bad DTMF charset, unknown tool).
    #[error("invalid_input")]
    InvalidInput,
    /// The operation exceeded its bounded deadline.
    #[error("timeout")]
    Timeout,
    /// The carrier media WebSocket closed.
    #[error("carrier_disconnect")]
    CarrierDisconnect,
    /// The AI provider WebSocket closed.
    #[error("provider_disconnect")]
    ProviderDisconnect,
    /// Didn't match a known pattern; treated conservatively as fatal.
    #[error("unknown")]
    Unknown,
}

impl ErrorKind {
    /// Whether this kind should be retried with backoff rather than surfaced.
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork { .. } | ErrorKind::Timeout)
    }
}

/// Classify an HTTP status code plus response body the way every REST
/// collaborator (carrier control, calendar, SMS) is classified.
pub fn classify_http(status: u16, body: &str) -> ErrorKind {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => ErrorKind::Authentication,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        429 => {
            let retry_after = extract_retry_after(&lower);
            ErrorKind::TransientNetwork { retry_after }
        }
        400 | 422 => ErrorKind::InvalidInput,
        500..=599 => ErrorKind::TransientNetwork { retry_after: None },
        _ => ErrorKind::Unknown,
    }
}

fn extract_retry_after(lower_body: &str) -> Option<Duration> {
    // Bodies from these providers sometimes embed "retry_after": <secs> in
    // the JSON error payload; the HTTP header is handled by the caller.
    let idx = lower_body.find("retry_after")?;
    let tail = &lower_body[idx..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

/// The exponential backoff schedule shared by every retried collaborator:
/// 1s, 2s, 4s, capped at 30s, at most 3 attempts.
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0, max_attempts: 3 }
    }

    /// Returns the delay for the next attempt, or `None` if attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let secs = 1u64 << self.attempt;
        self.attempt += 1;
        Some(Duration::from_secs(secs.min(30)))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(classify_http(401, ""), ErrorKind::Authentication);
        assert_eq!(classify_http(404, ""), ErrorKind::NotFound);
        assert_eq!(classify_http(503, ""), ErrorKind::TransientNetwork { retry_after: None });
        assert_eq!(classify_http(422, ""), ErrorKind::InvalidInput);
    }

    #[test]
    fn retry_after_extracted_from_body() {
        let kind = classify_http(429, r#"{"error":"rate limited","retry_after": 12}"#);
        assert_eq!(kind, ErrorKind::TransientNetwork { retry_after: Some(Duration::from_secs(12)) });
    }

    #[test]
    fn backoff_schedule_caps_and_exhausts() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn should_retry_matches_transient_and_timeout_only() {
        assert!(ErrorKind::TransientNetwork { retry_after: None }.should_retry());
        assert!(ErrorKind::Timeout.should_retry());
        assert!(!ErrorKind::Authentication.should_retry());
        assert!(!ErrorKind::NotFound.should_retry());
    }
}

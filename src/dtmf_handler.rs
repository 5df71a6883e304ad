//! DTMF transmission (§4.3).
//!
//! The sole component permitted to transmit DTMF to the carrier. The IVR
//! detector's `DtmfParser` only extracts and reports digit sequences; this
//! module decides when to actually send them, de-duplicating against the
//! incremental scan position so a digit is never sent twice for one tag.
//!
//! Methods are invoked from the session's single cooperative task, so the
//! scan position and cooldown timestamp need no lock.

use crate::ivr::DtmfParser;
use std::time::{Duration, Instant};

const DEFAULT_COOLDOWN: Duration = Duration::from_millis(3000);

/// Digits extracted from the agent's speech and ready to send, with the
/// handler's cooldown already accounted for.
pub struct DtmfHandler {
    /// Byte offset into the full accumulated agent transcript already
    /// scanned for tags.
    scanned_up_to: usize,
    last_sent_at: Option<Instant>,
    cooldown: Duration,
}

impl Default for DtmfHandler {
    fn default() -> Self {
        Self {
            scanned_up_to: 0,
            last_sent_at: None,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl DtmfHandler {
    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            ..Default::default()
        }
    }

    /// Reset scan position when the provider starts a new response
    /// (`response.created`). Cooldown timing is untouched.
    pub fn reset_scan(&mut self) {
        self.scanned_up_to = 0;
    }

    /// Scan the newly-appended suffix of the accumulated agent transcript
    /// for DTMF tags, returning digit sequences not yet seen and not
    /// blocked by cooldown. The scan position only advances past a span
    /// once it yields nothing or its digits actually go out (sent, this
    /// call); a span blocked by cooldown is left unscanned so it is
    /// retried on a later call once cooldown elapses.
    pub fn scan(&mut self, full_transcript: &str, now: Instant) -> Vec<String> {
        if self.scanned_up_to > full_transcript.len() {
            // Provider transcript shrank (shouldn't happen); resync.
            self.scanned_up_to = 0;
        }
        let unscanned = &full_transcript[self.scanned_up_to..];
        let (digits, _stripped) = DtmfParser::extract(unscanned);

        if digits.is_empty() {
            self.scanned_up_to = full_transcript.len();
            return Vec::new();
        }
        if let Some(last) = self.last_sent_at {
            if now.duration_since(last) < self.cooldown {
                return Vec::new();
            }
        }
        self.scanned_up_to = full_transcript.len();
        self.last_sent_at = Some(now);
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_reports_new_tag_only_once() {
        let mut handler = DtmfHandler::default();
        let now = Instant::now();
        let transcript = "I'll press one. <dtmf>1</dtmf>";
        let digits = handler.scan(transcript, now);
        assert_eq!(digits, vec!["1".to_string()]);

        // Same tag appears again in the stream because the provider re-sent
        // the whole accumulated text; the scan position has already moved
        // past it so nothing new is reported.
        let digits_again = handler.scan(transcript, now);
        assert!(digits_again.is_empty());
    }

    #[test]
    fn scan_respects_cooldown_between_sends() {
        let mut handler = DtmfHandler::with_cooldown(Duration::from_millis(3000));
        let t0 = Instant::now();
        let first = handler.scan("<dtmf>1</dtmf>", t0);
        assert_eq!(first, vec!["1".to_string()]);

        let t1 = t0 + Duration::from_millis(500);
        let second = handler.scan("<dtmf>1</dtmf><dtmf>2</dtmf>", t1);
        assert!(second.is_empty(), "cooldown should suppress a send this soon");

        // "2" was discovered during cooldown and must not be lost: once
        // cooldown clears it is retried alongside the newly-arrived "3".
        let t2 = t0 + Duration::from_millis(3500);
        let third = handler.scan("<dtmf>1</dtmf><dtmf>2</dtmf><dtmf>3</dtmf>", t2);
        assert_eq!(third, vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn reset_scan_allows_rescanning_from_start() {
        let mut handler = DtmfHandler::default();
        let now = Instant::now();
        handler.scan("<dtmf>1</dtmf>", now);
        handler.reset_scan();
        let later = now + Duration::from_millis(3500);
        let digits = handler.scan("<dtmf>1</dtmf>", later);
        assert_eq!(digits, vec!["1".to_string()]);
    }

    #[test]
    fn scan_with_no_tags_returns_empty() {
        let mut handler = DtmfHandler::default();
        let digits = handler.scan("just talking, no tags here", Instant::now());
        assert!(digits.is_empty());
    }
}

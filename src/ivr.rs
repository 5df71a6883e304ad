//! IVR classification, loop detection, and DTMF tag extraction (§4.2).
//!
//! Pure classification and state tracking; this module never sends DTMF
//! itself (that's `dtmf_handler`'s exclusive job, see the Open Question
//! resolution in SPEC_FULL.md §9).

use crate::types::IVRMode;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;

const MIN_TRANSCRIPT_LEN: usize = 10;
const DEFAULT_CONSECUTIVE_CLASSIFICATIONS: u32 = 2;
const DEFAULT_RING_BUFFER_SIZE: usize = 10;
const DEFAULT_LOOP_SIMILARITY_THRESHOLD: f64 = 0.85;

static EXCLUSIVE_IVR: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)press\s+\w+").unwrap(),
        Regex::new(r"(?i)dial\s+\w+").unwrap(),
        Regex::new(r"(?i)for\s+\w+.{0,20}press\s+\w+").unwrap(),
        Regex::new(r"(?i)enter\s+your\s+extension").unwrap(),
        Regex::new(r"(?i)enter\s+the\s+\w+.{0,10}digit").unwrap(),
        Regex::new(r"(?i)main\s+menu").unwrap(),
    ]
});

static IVR_ERROR: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)not\s+a\s+valid\s+extension").unwrap(),
        Regex::new(r"(?i)invalid\s+selection").unwrap(),
        Regex::new(r"(?i)please\s+try\s+again(?!\s+later)").unwrap(),
        Regex::new(r"(?i)i\s+did(n't|\s+not)\s+understand\s+(your|that)\s+(selection|entry)").unwrap(),
    ]
});

static HUMAN_CONVERSATION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)how\s+can\s+i\s+help").unwrap(),
        Regex::new(r"(?i)this\s+is\s+\w+\s+speaking").unwrap(),
        Regex::new(r"(?i)^(hi|hello|hey)[,!.\s]").unwrap(),
        Regex::new(r"(?i)thanks?\s+for\s+calling").unwrap(),
        Regex::new(r"(?i)(yeah|yep|sure|sounds\s+good|no\s+problem)").unwrap(),
    ]
});

static VOICEMAIL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)leave\s+a\s+message").unwrap(),
        Regex::new(r"(?i)at\s+the\s+beep").unwrap(),
        Regex::new(r"(?i)after\s+the\s+tone").unwrap(),
        Regex::new(r"(?i)(is\s+not\s+available|can't\s+come\s+to\s+the\s+phone)").unwrap(),
    ]
});

static DTMF_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<dtmf>([0-9*#A-Dw]+)</dtmf>").unwrap());

fn count_matches(patterns: &[Regex], text: &str) -> u32 {
    patterns.iter().filter(|re| re.is_match(text)).count() as u32
}

/// Classifies a single transcript fragment into an `(IVRMode, confidence)`
/// pair. Stateless; callers own mode latching.
pub struct Classifier;

impl Classifier {
    /// Confidence is a coarse signal derived from match counts, not a
    /// calibrated probability.
    pub fn classify(text: &str) -> (IVRMode, f64) {
        if text.trim().len() < MIN_TRANSCRIPT_LEN {
            return (IVRMode::Unknown, 0.0);
        }

        let ivr_exclusive = count_matches(&EXCLUSIVE_IVR, text);
        let ivr_error = count_matches(&IVR_ERROR, text);
        let human = count_matches(&HUMAN_CONVERSATION, text);
        let voicemail = count_matches(&VOICEMAIL, text);
        let ivr = ivr_exclusive + ivr_error;

        if ivr_exclusive > 0 || ivr_error > 0 {
            return (IVRMode::Ivr, confidence(ivr, human + voicemail));
        }
        let total = ivr + human + voicemail;
        if total == 0 {
            return (IVRMode::Unknown, 0.0);
        }
        if human > ivr && human > voicemail {
            return (IVRMode::Conversation, confidence(human, ivr + voicemail));
        }
        if voicemail > 0 && ivr == 0 {
            return (IVRMode::Voicemail, confidence(voicemail, human));
        }
        if ivr > 0 {
            return (IVRMode::Ivr, confidence(ivr, human + voicemail));
        }
        (IVRMode::Unknown, 0.0)
    }
}

fn confidence(winning: u32, rest: u32) -> f64 {
    let total = (winning + rest) as f64;
    if total == 0.0 {
        0.0
    } else {
        (winning as f64 / total).min(1.0)
    }
}

/// Tracks consecutive classifications to decide when the latched mode
/// should actually switch (§4.2 "mode latching").
#[derive(Debug, Clone)]
pub struct ModeLatch {
    current: IVRMode,
    pending: Option<IVRMode>,
    consecutive: u32,
    required: u32,
}

impl Default for ModeLatch {
    fn default() -> Self {
        Self {
            current: IVRMode::Unknown,
            pending: None,
            consecutive: 0,
            required: DEFAULT_CONSECUTIVE_CLASSIFICATIONS,
        }
    }
}

impl ModeLatch {
    pub fn current(&self) -> IVRMode {
        self.current
    }

    /// Feed a new classification. Returns `true` if the latched mode
    /// changed as a result. `Unknown` never resets the run of the pending
    /// mode; it is simply ignored for latching purposes.
    pub fn feed(&mut self, mode: IVRMode) -> bool {
        if mode == IVRMode::Unknown {
            return false;
        }
        if mode == self.current {
            self.pending = None;
            self.consecutive = 0;
            return false;
        }
        if self.pending == Some(mode) {
            self.consecutive += 1;
        } else {
            self.pending = Some(mode);
            self.consecutive = 1;
        }
        if self.consecutive >= self.required {
            self.current = mode;
            self.pending = None;
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

/// Jaccard similarity over lowercased word sets. Shipped as the sole,
/// primary loop-detection comparator (no vetted TF-IDF crate is available).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Bounded ring buffer of prior IVR-mode transcripts, flagging when the
/// same menu repeats.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    buffer: VecDeque<String>,
    capacity: usize,
    threshold: f64,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self {
            buffer: VecDeque::with_capacity(DEFAULT_RING_BUFFER_SIZE),
            capacity: DEFAULT_RING_BUFFER_SIZE,
            threshold: DEFAULT_LOOP_SIMILARITY_THRESHOLD,
        }
    }
}

impl LoopDetector {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    /// Record a new IVR-mode transcript and report whether it matches a
    /// prior entry closely enough to count as a loop.
    pub fn record(&mut self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let is_loop = self.buffer.iter().any(|prior| jaccard_similarity(prior, &lower) >= self.threshold);
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(lower);
        is_loop
    }

    /// Compare a fresh menu transcript against the last recorded one,
    /// without mutating the buffer (§4.2 "menu-change validation").
    pub fn menu_changed(&self, new_text: &str) -> bool {
        match self.buffer.back() {
            Some(prior) => jaccard_similarity(prior, &new_text.to_lowercase()) < self.threshold,
            None => true,
        }
    }
}

/// Extracts `<dtmf>DIGITS</dtmf>` tags from AI-emitted text. Reports digits
/// to the caller; never transmits them.
pub struct DtmfParser;

impl DtmfParser {
    /// Returns every digit sequence found, in order of appearance, and the
    /// input with the tags stripped (for UI-facing transcript display).
    pub fn extract(text: &str) -> (Vec<String>, String) {
        let mut found = Vec::new();
        for cap in DTMF_TAG.captures_iter(text) {
            found.push(cap[1].to_uppercase());
        }
        let stripped = DTMF_TAG.replace_all(text, "").to_string();
        (found, stripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_transcript_is_unknown() {
        assert_eq!(Classifier::classify("press 1"), (IVRMode::Unknown, 0.0));
    }

    #[test]
    fn exclusive_ivr_pattern_forces_ivr() {
        let (mode, _) = Classifier::classify("For sales press 1, for support press 2");
        assert_eq!(mode, IVRMode::Ivr);
    }

    #[test]
    fn ivr_error_pattern_forces_ivr() {
        let (mode, _) = Classifier::classify("That is not a valid extension, please try again");
        assert_eq!(mode, IVRMode::Ivr);
    }

    #[test]
    fn try_again_later_does_not_match_ivr_error() {
        let (mode, _) = Classifier::classify("We are closed, please try again later tomorrow");
        assert_ne!(mode, IVRMode::Ivr);
    }

    #[test]
    fn human_greeting_is_conversation() {
        let (mode, _) = Classifier::classify("Hi there, how can I help you today?");
        assert_eq!(mode, IVRMode::Conversation);
    }

    #[test]
    fn voicemail_without_ivr_signal() {
        let (mode, _) = Classifier::classify("You have reached my voicemail, please leave a message after the tone");
        assert_eq!(mode, IVRMode::Voicemail);
    }

    #[test]
    fn mode_latch_requires_repeat_classification() {
        let mut latch = ModeLatch::default();
        assert!(!latch.feed(IVRMode::Ivr));
        assert_eq!(latch.current(), IVRMode::Unknown);
        assert!(latch.feed(IVRMode::Ivr));
        assert_eq!(latch.current(), IVRMode::Ivr);
    }

    #[test]
    fn mode_latch_second_feed_of_same_transcript_latches() {
        // §8: "if the same transcript is fed twice in a row, the mode latches
        // on the second feed, not the first."
        let mut latch = ModeLatch::default();
        let text = "For sales press 1, for support press 2";
        let (mode, _) = Classifier::classify(text);
        assert!(!latch.feed(mode));
        let (mode2, _) = Classifier::classify(text);
        assert!(latch.feed(mode2));
    }

    #[test]
    fn unknown_does_not_reset_pending_count() {
        let mut latch = ModeLatch::default();
        latch.feed(IVRMode::Ivr);
        assert!(!latch.feed(IVRMode::Unknown));
        assert!(latch.feed(IVRMode::Ivr));
    }

    #[test]
    fn jaccard_identical_strings_is_one() {
        assert_eq!(jaccard_similarity("press one for sales", "press one for sales"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_strings_is_zero() {
        assert_eq!(jaccard_similarity("press one", "totally different words"), 0.0);
    }

    #[test]
    fn loop_detector_flags_repeated_menu() {
        let mut detector = LoopDetector::default();
        let menu = "for sales press one for support press two";
        assert!(!detector.record(menu));
        assert!(detector.record(menu));
    }

    #[test]
    fn loop_detector_does_not_flag_different_menu() {
        let mut detector = LoopDetector::default();
        assert!(!detector.record("for sales press one for support press two"));
        assert!(!detector.record("for billing press three for technical support press four"));
    }

    #[test]
    fn menu_changed_checks_without_mutating() {
        let mut detector = LoopDetector::default();
        detector.record("for sales press one");
        assert!(!detector.menu_changed("for sales press one"));
        assert!(detector.menu_changed("completely different menu text here"));
        // still only one entry recorded
        assert!(!detector.record("for sales press one"));
    }

    #[test]
    fn dtmf_extraction_reports_digits_and_strips_tags() {
        let (digits, stripped) = DtmfParser::extract("I'll press one. <dtmf>1</dtmf>");
        assert_eq!(digits, vec!["1".to_string()]);
        assert_eq!(stripped, "I'll press one. ");
    }

    #[test]
    fn dtmf_extraction_allows_pause_glyph_and_multiple_tags() {
        let (digits, _) = DtmfParser::extract("<dtmf>1w2</dtmf> then <dtmf>9</dtmf>");
        assert_eq!(digits, vec!["1W2".to_string(), "9".to_string()]);
    }
}

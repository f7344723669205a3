//! ============================================================================
//! Incoming-Call Classifier - "is the character calling right now?"
//! ============================================================================
//! Three-stage screen over assistant text, cheapest first:
//! 1. explicit call-now phrasing (English or Korean) -> incoming, no AI call
//! 2. broader call vocabulary -> one AI request for strict JSON confidence
//! 3. AI failure/unparsable output -> narrow deterministic fallback regex
//! No call vocabulary at all skips the AI entirely. Each transcript index is
//! classified at most once; re-renders of the same index are ignored.
//! ============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::generation::TextGenerationService;

/// Phrasing that unambiguously means a call is happening right now
const EXPLICIT_PATTERN: &str = "(?i)(incoming call|is calling you|calling you (right )?now\
|picks? up (the|her|his|their) phone and calls|(your|the) phone (rings|is ringing|buzzes)\
|전화[를가]? ?(걸|왔|온|오고|울리)|지금 전화|전화할게)";

/// Narrow screen used only when the AI check fails; catches direct
/// pick-up-the-phone phrasing the explicit screen treats as too weak
const FALLBACK_PATTERN: &str =
    "(?i)(pick up( the| your)? phone|answer (the|your) phone|전화 받아|지금 통화)";

/// Broad call vocabulary gating the AI request (cost control)
const CALL_KEYWORDS: &[&str] = &[
    "call",
    "phone",
    "ring",
    "dial",
    "voicemail",
    "전화",
    "통화",
    "수신",
    "벨소리",
];

#[derive(Debug, Deserialize)]
struct IntentJudgment {
    incoming_call: bool,
    confidence: f32,
}

/// Classifies assistant turns into an "incoming call right now" signal
pub struct IncomingCallClassifier {
    generation: Arc<dyn TextGenerationService>,
    confidence_threshold: f32,
    explicit: Regex,
    fallback: Regex,
    /// Highest transcript index already examined; -1 before the first turn
    highest_seen: AtomicI64,
}

impl IncomingCallClassifier {
    pub fn new(generation: Arc<dyn TextGenerationService>, confidence_threshold: f32) -> Self {
        Self {
            generation,
            confidence_threshold,
            // Patterns are compile-time constants; a failure here is a
            // programming error caught by the tests below
            explicit: Regex::new(EXPLICIT_PATTERN).expect("explicit pattern"),
            fallback: Regex::new(FALLBACK_PATTERN).expect("fallback pattern"),
            highest_seen: AtomicI64::new(-1),
        }
    }

    /// Record an index as examined without classifying it (used while a call
    /// is active, when no prompt could be shown anyway)
    pub fn note_rendered(&self, index: usize) {
        self.highest_seen.fetch_max(index as i64, Ordering::SeqCst);
    }

    /// Returns true when `text` at transcript `index` reads as an incoming
    /// call. At most one AI request per invocation, none for re-renders.
    pub async fn classify(&self, index: usize, text: &str) -> bool {
        // Claim the index before any await so a re-render racing this call
        // cannot classify it twice
        let prev = self.highest_seen.fetch_max(index as i64, Ordering::SeqCst);
        if prev >= index as i64 {
            debug!("Index {} already examined, skipping", index);
            return false;
        }

        if self.explicit.is_match(text) {
            debug!("Explicit call phrasing at index {}", index);
            return true;
        }

        let lower = text.to_lowercase();
        if !CALL_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return false;
        }

        let prompt = format!(
            "Read the following roleplay message and decide whether the character is \
            initiating a phone call to the user RIGHT NOW (not talking about a past or \
            future call).\n\nMessage:\n{}\n\nAnswer with strict JSON only, no prose:\n\
            {{\"incoming_call\": true|false, \"confidence\": 0.0-1.0}}",
            text
        );

        match self.generation.quiet_generate(&prompt, "system").await {
            Ok(reply) => match parse_judgment(&reply) {
                Some(judgment) => {
                    debug!(
                        "AI judgment at index {}: incoming={} confidence={}",
                        index, judgment.incoming_call, judgment.confidence
                    );
                    judgment.incoming_call && judgment.confidence >= self.confidence_threshold
                }
                None => {
                    warn!("Unparsable classifier output, using fallback screen");
                    self.fallback.is_match(text)
                }
            },
            Err(e) => {
                warn!("Classifier generation failed ({}), using fallback screen", e);
                self.fallback.is_match(text)
            }
        }
    }
}

/// Pull the first JSON object out of model output that may be wrapped in
/// prose or code fences
fn parse_judgment(reply: &str) -> Option<IntentJudgment> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

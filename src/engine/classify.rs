//! Pure text classifiers for tool results and vision feedback.
//!
//! All matching is case-insensitive substring search over named phrase
//! lists, so the policy is auditable in one place. No state, no I/O.

use std::sync::OnceLock;

use regex::Regex;

/// Phrases marking a tool result as an execution error.
pub const TOOL_ERROR_PHRASES: &[&str] = &["error", "failed", "not found"];

/// Error phrases that are fatal when they appear during a foundational
/// step: the scene is likely in an unrecoverable shape.
pub const FATAL_PHRASES: &[&str] = &["not found", "no attribute", "keyerror"];

/// Phrases in vision feedback that indicate a spatial hazard (the work is
/// hidden or occluded) regardless of the numeric score.
pub const HAZARD_PHRASES: &[&str] = &[
    "hidden",
    "occluded",
    "obscured",
    "blocked",
    "overshadow",
    "not visible",
    "cannot see",
];

/// Score when no numeric score can be extracted from feedback text.
pub const NEUTRAL_SCORE: u8 = 50;

/// Whether a tool result text reports an execution error.
pub fn is_tool_error(result: &str) -> bool {
    let lower = result.to_lowercase();
    TOOL_ERROR_PHRASES.iter().any(|p| lower.contains(p))
}

/// Whether an error is fatal for the given step. Fatal phrases only halt
/// the run during foundational steps (index at or below the cutoff);
/// later on the same phrases are recoverable noise.
pub fn is_fatal_error(result: &str, step_index: usize, critical_cutoff: usize) -> bool {
    if step_index > critical_cutoff {
        return false;
    }
    let lower = result.to_lowercase();
    FATAL_PHRASES.iter().any(|p| lower.contains(p))
}

/// Detect a spatial hazard in vision feedback. Returns the matched phrase.
/// "behind" alone is too common to flag; it only counts next to "object".
pub fn detect_hazard(feedback: &str) -> Option<&'static str> {
    let lower = feedback.to_lowercase();
    if let Some(phrase) = HAZARD_PHRASES.iter().copied().find(|p| lower.contains(p)) {
        return Some(phrase);
    }
    if lower.contains("behind") && lower.contains("object") {
        return Some("behind object");
    }
    None
}

fn score_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(\d{1,3})\s*/\s*100").unwrap(),
            Regex::new(r"(\d{1,3})\s*%").unwrap(),
            Regex::new(r"(?i)rating:?\s*(\d{1,3})").unwrap(),
        ]
    })
}

/// Extract a 0-100 score from vision feedback. Patterns are tried in
/// order (`NN/100`, `NN%`, `rating: NN`); the first match wins, values
/// clamp to 100, and absence yields [`NEUTRAL_SCORE`].
pub fn extract_score(feedback: &str) -> u8 {
    for pattern in score_patterns() {
        if let Some(captures) = pattern.captures(feedback) {
            if let Some(m) = captures.get(1) {
                if let Ok(value) = m.as_str().parse::<u32>() {
                    return value.min(100) as u8;
                }
            }
        }
    }
    NEUTRAL_SCORE
}

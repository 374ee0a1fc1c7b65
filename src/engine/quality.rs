//! Quality gate: accept or refine a step from its vision feedback.

use super::classify::detect_hazard;
use super::task::QualityAssessment;

/// Decides accept-vs-refine. Stateless; the refinement counter lives on
/// the task and is passed in per assessment.
pub struct QualityGate {
    /// Steps below this index need the higher acceptance threshold
    critical_cutoff: usize,
    max_refinements: u32,
}

/// Acceptance threshold for foundational steps (index below the cutoff).
pub const FOUNDATIONAL_THRESHOLD: u8 = 70;
/// Acceptance threshold for later steps.
pub const LATER_THRESHOLD: u8 = 60;

impl QualityGate {
    pub fn new(critical_cutoff: usize, max_refinements: u32) -> Self {
        Self {
            critical_cutoff,
            max_refinements,
        }
    }

    /// Assess one feedback cycle. `attempts_used` is the 1-based count of
    /// feedback attempts for this step, including the current one. A
    /// hazard phrase forces refinement regardless of score, and the
    /// refinement cap forces acceptance regardless of both, so refinement
    /// is always bounded.
    pub fn assess(
        &self,
        feedback: &str,
        score: u8,
        step_index: usize,
        attempts_used: u32,
    ) -> QualityAssessment {
        if attempts_used >= self.max_refinements {
            tracing::debug!(step_index, attempts_used, "refinement cap reached, forcing accept");
            return QualityAssessment {
                score,
                accepted: true,
                hazard: None,
                cap_forced: true,
            };
        }

        if let Some(hazard) = detect_hazard(feedback) {
            tracing::info!(step_index, hazard, "hazard detected, refining");
            return QualityAssessment {
                score,
                accepted: false,
                hazard: Some(hazard.to_string()),
                cap_forced: false,
            };
        }

        let threshold = if step_index < self.critical_cutoff {
            FOUNDATIONAL_THRESHOLD
        } else {
            LATER_THRESHOLD
        };
        QualityAssessment {
            score,
            accepted: score >= threshold,
            hazard: None,
            cap_forced: false,
        }
    }
}

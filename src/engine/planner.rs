//! Plan generation: goal -> ordered step descriptions.

use std::sync::OnceLock;

use regex::Regex;

use super::task::{Goal, StepDescription};
use crate::llm::gateway::{ReasoningGateway, VisionGateway};
use crate::llm::LlmError;

/// Scenes with fewer elements than this are treated as template/default
/// content; completed-step detection is skipped entirely.
pub const SCENE_NOISE_THRESHOLD: usize = 4;

/// At most this fraction of a plan may be skipped as already-completed.
pub const MAX_SKIP_FRACTION: f64 = 0.30;

const PLANNING_SYSTEM: &str = "You are a 3D artist planning work inside a 3D content tool. \
Respond with a numbered list of concrete, sequential modeling steps. \
Each step must be a single achievable action. No preamble, no commentary.";

/// Summary of the controlled application's current state, used for
/// completed-step detection on resume.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSnapshot {
    pub element_count: usize,
    pub summary: String,
}

impl EnvironmentSnapshot {
    /// Build a snapshot from a scene-info tool result. The result is
    /// expected to be JSON with an `objects` array; anything else counts
    /// as zero elements.
    pub fn from_scene_info(result: &str) -> Self {
        let element_count = serde_json::from_str::<serde_json::Value>(result)
            .ok()
            .and_then(|v| v.get("objects").and_then(|o| o.as_array().map(|a| a.len())))
            .unwrap_or(0);
        Self {
            element_count,
            summary: result.to_string(),
        }
    }
}

pub struct Planner {
    reasoning: ReasoningGateway,
    vision: VisionGateway,
}

impl Planner {
    pub fn new(reasoning: ReasoningGateway, vision: VisionGateway) -> Self {
        Self { reasoning, vision }
    }

    /// Produce an ordered plan for the goal. Never returns an empty list:
    /// if the model's response yields zero parseable steps, the fixed
    /// fallback plan is used instead.
    pub async fn plan(
        &self,
        goal: &Goal,
        reference_image: Option<&str>,
        prior_feedback: &[String],
    ) -> Result<Vec<StepDescription>, LlmError> {
        let mut prompt = match goal {
            Goal::Brief { text } => format!(
                "Create a step-by-step plan to build the following in the 3D scene:\n\n{}\n",
                text
            ),
            Goal::Image { .. } => {
                let analysis = match reference_image {
                    Some(image) => {
                        self.vision
                            .analyze(
                                "Describe this image as a 3D scene to reproduce: list the \
                                 shapes, their rough proportions, arrangement, and materials.",
                                image,
                            )
                            .await?
                    }
                    None => goal.describe(),
                };
                format!(
                    "Create a step-by-step plan to reproduce this scene in the 3D tool. \
                     Scene analysis:\n\n{}\n",
                    analysis
                )
            }
        };

        if !prior_feedback.is_empty() {
            prompt.push_str("\nFeedback from earlier attempts to address:\n");
            for entry in prior_feedback {
                prompt.push_str("- ");
                prompt.push_str(entry);
                prompt.push('\n');
            }
        }
        prompt.push_str("\nRespond with a numbered list of 5-10 steps.");

        let response = self
            .reasoning
            .complete_text(Some(PLANNING_SYSTEM), &prompt)
            .await?;

        let mut steps = parse_numbered_list(&response);
        if steps.is_empty() {
            tracing::warn!("plan response had no parseable steps, using fallback plan");
            steps = fallback_plan();
        }
        tracing::info!(steps = steps.len(), "plan created");

        Ok(steps
            .into_iter()
            .enumerate()
            .map(|(i, text)| StepDescription::new(i, text))
            .collect())
    }

    /// Ask which planned steps are already fully done in the current
    /// scene. Only runs on scenes above the noise threshold; skips are
    /// capped at 30% of the plan so over-eager detection cannot hollow
    /// out a run.
    pub async fn detect_completed_steps(
        &self,
        plan: &[StepDescription],
        snapshot: &EnvironmentSnapshot,
    ) -> Result<Vec<usize>, LlmError> {
        if snapshot.element_count < SCENE_NOISE_THRESHOLD {
            tracing::debug!(
                elements = snapshot.element_count,
                "scene below noise threshold, starting fresh"
            );
            return Ok(Vec::new());
        }

        let mut prompt = String::from(
            "The 3D scene below already contains work from an earlier run. \
             Decide which of the planned steps are FULLY completed. Be strict: \
             a step counts only if the scene shows substantial finished geometry \
             for it, not placeholders or partial work.\n\nScene state:\n",
        );
        prompt.push_str(&snapshot.summary);
        prompt.push_str("\n\nPlanned steps:\n");
        for step in plan {
            prompt.push_str(&format!("{}. {}\n", step.index + 1, step.text));
        }
        prompt.push_str(
            "\nRespond with only the numbers of fully completed steps, \
             comma-separated (e.g. \"1, 2\"), or \"none\".",
        );

        let response = self.reasoning.complete_text(None, &prompt).await?;
        let mut indices = parse_step_numbers(&response, plan.len());

        let max_skippable = (plan.len() as f64 * MAX_SKIP_FRACTION).floor() as usize;
        if indices.len() > max_skippable {
            tracing::warn!(
                detected = indices.len(),
                cap = max_skippable,
                "capping completed-step detection"
            );
            indices.truncate(max_skippable);
        }
        Ok(indices)
    }
}

fn step_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // "1. text", "1) text", "Step 1: text" in any case
        Regex::new(r"(?i)^\s*(?:step\s+)?(\d+)\s*[.):]\s*(.+)$").unwrap()
    })
}

/// Parse a numbered list out of free-form model text. Non-matching lines
/// (preamble, blank lines, commentary) are ignored.
pub fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            step_line_pattern()
                .captures(line)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Fixed generic plan used when parsing yields nothing.
pub fn fallback_plan() -> Vec<String> {
    vec![
        "Clear the scene of default objects".to_string(),
        "Create the primary shape of the subject".to_string(),
        "Add secondary shapes and structural details".to_string(),
        "Apply basic materials and colors".to_string(),
        "Position the camera and adjust lighting for a clear view".to_string(),
    ]
}

/// Extract 1-based step numbers from a model response and return them as
/// sorted, deduplicated 0-based indices within bounds.
fn parse_step_numbers(text: &str, plan_len: usize) -> Vec<usize> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let pattern = NUMBER.get_or_init(|| Regex::new(r"\d+").unwrap());

    if text.to_lowercase().contains("none") {
        return Vec::new();
    }
    let mut indices: Vec<usize> = pattern
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<usize>().ok())
        .filter(|n| *n >= 1 && *n <= plan_len)
        .map(|n| n - 1)
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_numbering_styles() {
        let text = "Here is the plan:\n\
                    1. Create the base platform\n\
                    2) Add a cylinder tower\n\
                    Step 3: Model the roof cone\n\
                    step 4. Apply stone material\n\
                    And that's it!";
        let steps = parse_numbered_list(text);
        assert_eq!(
            steps,
            vec![
                "Create the base platform",
                "Add a cylinder tower",
                "Model the roof cone",
                "Apply stone material",
            ]
        );
    }

    #[test]
    fn ignores_preamble_and_blank_lines() {
        let text = "Sure! Let me think.\n\nThe subject needs a base.\n\n1. Build the base\n";
        assert_eq!(parse_numbered_list(text), vec!["Build the base"]);
    }

    #[test]
    fn fallback_plan_has_at_least_five_steps() {
        assert!(fallback_plan().len() >= 5);
        assert!(parse_numbered_list("no numbers here at all").is_empty());
    }

    #[test]
    fn snapshot_counts_objects_array() {
        let snap = EnvironmentSnapshot::from_scene_info(
            r#"{"objects": [{"name": "Cube"}, {"name": "Light"}], "frame": 1}"#,
        );
        assert_eq!(snap.element_count, 2);
        assert_eq!(EnvironmentSnapshot::from_scene_info("not json").element_count, 0);
    }

    #[test]
    fn step_numbers_parse_and_bound() {
        assert_eq!(parse_step_numbers("1, 2, 7", 5), vec![0, 1]);
        assert_eq!(parse_step_numbers("Steps 2 and 2 are done", 5), vec![1]);
        assert!(parse_step_numbers("None of them", 5).is_empty());
        assert!(parse_step_numbers("0", 5).is_empty());
    }
}

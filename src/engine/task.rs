//! Core task state: goals, plans, phases, and snapshots.
//!
//! Everything here is serde-round-trippable so a task can be frozen into
//! a checkpoint at any step boundary and resumed in a fresh process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// What the task is trying to achieve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    /// A textual creative brief ("build a medieval watchtower")
    Brief { text: String },
    /// A reference image to reproduce
    Image { path: PathBuf },
}

impl Goal {
    /// A short text form for prompts and logging.
    pub fn describe(&self) -> String {
        match self {
            Goal::Brief { text } => text.clone(),
            Goal::Image { path } => format!("reproduce the reference image at {}", path.display()),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Goal::Image { .. })
    }
}

/// Orchestrator phase. Transitions are driven exclusively by the
/// orchestrator loop; all other components are pure with respect to phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Plan,
    Execute,
    Feedback,
    QualityGate,
    Refine,
    Evaluate,
    Replan,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Cancelled)
    }
}

/// One step of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescription {
    pub index: usize,
    pub text: String,
    /// Marked when resumption detects this step's work already present
    #[serde(default)]
    pub completed: bool,
}

impl StepDescription {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            completed: false,
        }
    }
}

/// Record of one tool invocation made while executing a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub step_index: usize,
    pub tool: String,
    pub params: serde_json::Value,
    pub success: bool,
    pub result: String,
    /// Path of a persisted artifact this call produced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

/// Vision feedback for one executed step (or refinement pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFeedback {
    pub step_index: usize,
    /// 0-100; 50 when no score could be extracted
    pub score: u8,
    pub feedback: String,
    /// Which refinement pass produced this (0 = initial execution)
    #[serde(default)]
    pub refinement: u32,
}

/// Quality gate verdict for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub score: u8,
    pub accepted: bool,
    /// Hazard phrase that forced rejection, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hazard: Option<String>,
    /// True when acceptance was forced by the refinement cap
    #[serde(default)]
    pub cap_forced: bool,
}

/// Terminal status of a finished (or suspended) task run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Cancelled,
    /// Iteration cap reached with work remaining
    PartialCompletion,
}

/// Full mutable state of one task. This is what checkpoints serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Stable key derived from the goal; names artifact directories
    pub session_key: String,
    pub goal: Goal,
    pub phase: Phase,
    pub plan: Vec<StepDescription>,
    /// Index of the next step to execute
    pub current_step: usize,
    /// Refinement passes spent on the current step
    pub refinements_used: u32,
    pub replan_attempts: u32,
    /// Loop iterations consumed so far (across resumes)
    pub iterations: u64,
    /// Steps skipped because resumption detected them already done
    pub completed_steps: Vec<usize>,
    /// Append-only record of every tool invocation
    pub tool_results: Vec<ToolInvocationRecord>,
    pub feedback_history: Vec<StepFeedback>,
    pub execution_errors: Vec<String>,
    pub critical_error: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(session_key: String, goal: Goal) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_key,
            goal,
            phase: Phase::Init,
            plan: Vec::new(),
            current_step: 0,
            refinements_used: 0,
            replan_attempts: 0,
            iterations: 0,
            completed_steps: Vec::new(),
            tool_results: Vec::new(),
            feedback_history: Vec::new(),
            execution_errors: Vec::new(),
            critical_error: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    /// Steps remaining, counting the current one.
    pub fn steps_remaining(&self) -> usize {
        self.plan.len().saturating_sub(self.current_step)
    }

    pub fn current_step_text(&self) -> Option<&str> {
        self.plan.get(self.current_step).map(|s| s.text.as_str())
    }

    /// Mean of the last `n` recorded scores, or `None` with no history.
    pub fn mean_recent_score(&self, n: usize) -> Option<f64> {
        if self.feedback_history.is_empty() {
            return None;
        }
        let recent: Vec<f64> = self
            .feedback_history
            .iter()
            .rev()
            .take(n)
            .map(|f| f.score as f64)
            .collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    pub fn latest_score(&self) -> Option<u8> {
        self.feedback_history.last().map(|f| f.score)
    }
}

/// Outcome summary returned to the caller when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub session_key: String,
    pub status: TaskStatus,
    pub steps_executed: usize,
    pub total_steps: usize,
    pub screenshots_captured: usize,
    pub quality_scores: Vec<u8>,
    pub final_score: Option<u8>,
    pub screenshot_directory: PathBuf,
    pub execution_errors: Vec<String>,
    /// Populated only for critical errors
    pub error: Option<String>,
    /// True when the iteration cap suspended the run early
    pub partial_completion: bool,
    /// True when a checkpoint exists that a later run can pick up
    pub can_resume: bool,
}

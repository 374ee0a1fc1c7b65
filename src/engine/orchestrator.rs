//! The orchestrator state machine.
//!
//! Drives one task from goal to terminal state:
//! `Init -> Plan -> Execute -> Feedback -> QualityGate -> {Refine ->
//! Feedback | Evaluate} -> {Execute | Replan -> Plan | Complete}`, with
//! `Complete`, `Failed` and `Cancelled` terminal. Checkpoints are written
//! at every step boundary and the iteration cap suspends gracefully
//! instead of erroring.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;

use super::events::{EventSink, ProgressEvent};
use super::executor::StepExecutor;
use super::feedback::FeedbackCapturer;
use super::planner::{EnvironmentSnapshot, Planner};
use super::quality::QualityGate;
use super::task::{Goal, Phase, StepFeedback, Task, TaskResult, TaskStatus};
use super::EngineError;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::llm::gateway::{ReasoningGateway, VisionGateway};
use crate::llm::LlmClient;
use crate::rpc::{ToolClient, ToolSchema};
use crate::session::session_key;

/// After all planned steps finish on an image goal, replan when the mean
/// of the last few scores falls below this.
const REPLAN_MEAN_THRESHOLD: f64 = 75.0;
/// How many recent scores feed the replan decision.
const REPLAN_SCORE_WINDOW: usize = 3;
/// Feedback entries carried into planning prompts.
const PLANNING_FEEDBACK_WINDOW: usize = 2;

pub struct Orchestrator {
    planner: Planner,
    executor: StepExecutor,
    capturer: FeedbackCapturer,
    gate: QualityGate,
    tool_client: Arc<dyn ToolClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: EventSink,
    max_iterations: u64,
    max_replanning_attempts: u32,
    screenshots_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmClient>,
        tool_client: Arc<dyn ToolClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: EventSink,
    ) -> Self {
        let reasoning = ReasoningGateway::new(
            llm.clone(),
            config.reasoning_model.clone(),
            config.rate_limit.clone(),
        );
        let vision = VisionGateway::new(
            llm,
            config.vision_model.clone(),
            config.rate_limit.clone(),
        );
        let screenshots_root = config.data_dir.join("screenshots");

        Self {
            planner: Planner::new(reasoning.clone(), vision.clone()),
            executor: StepExecutor::new(
                reasoning,
                config.step_delay,
                config.critical_step_cutoff,
            ),
            capturer: FeedbackCapturer::new(vision, screenshots_root.clone()),
            gate: QualityGate::new(config.critical_step_cutoff, config.max_refinements_per_step),
            tool_client,
            checkpoints,
            events,
            max_iterations: config.max_iterations as u64,
            max_replanning_attempts: config.max_replanning_attempts,
            screenshots_root,
        }
    }

    /// Run one task to a terminal state (or graceful suspension).
    ///
    /// With `resume=true`, a prior checkpoint for the same session key is
    /// restored and the controlled application's current state is
    /// inspected for already-completed steps.
    pub async fn run(
        &self,
        goal: Goal,
        resume: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<TaskResult, EngineError> {
        let key = session_key(&goal);
        let reference_image = self.load_reference(&goal).await?;

        let mut task = match self.restore(&key, resume).await? {
            Some(restored) => {
                // A finished task resumed again is a no-op: report the
                // stored outcome without touching the scene.
                if restored.phase.is_terminal()
                    || (!restored.plan.is_empty() && restored.current_step >= restored.plan.len())
                {
                    let mut done = restored;
                    if !done.phase.is_terminal() {
                        done.phase = Phase::Complete;
                    }
                    return Ok(self.result_for(&done, self.status_of(&done), false));
                }
                let mut restored = restored;
                // Every run gets a fresh iteration budget; the persisted
                // counter belongs to the run that wrote the checkpoint, and
                // carrying it over would make a cap-suspended task
                // re-suspend immediately instead of resuming.
                restored.iterations = 0;
                restored
            }
            None => Task::new(key.clone(), goal.clone()),
        };

        self.events.emit(ProgressEvent::TaskStarted {
            task_id: task.id,
            session_key: task.session_key.clone(),
            goal: task.goal.describe(),
        });

        let tools = self.tool_client.list_tools().await?;
        tracing::info!(session_key = %key, tools = tools.len(), resume, "task starting");

        if task.plan.is_empty() {
            self.plan_phase(&mut task, &tools, reference_image.as_deref(), resume)
                .await?;
        }

        loop {
            task.iterations += 1;
            if task.iterations > self.max_iterations {
                return self.suspend_at_cap(&task).await;
            }

            match task.phase {
                Phase::Execute => {
                    if cancel.load(Ordering::SeqCst) {
                        task.cancelled = true;
                        task.phase = Phase::Cancelled;
                        self.save_checkpoint(&task).await;
                        continue;
                    }
                    if task.current_step >= task.plan.len() {
                        task.phase = Phase::Evaluate;
                        continue;
                    }
                    self.execute_phase(&mut task, &tools, None).await?;
                }
                Phase::Refine => {
                    let guidance = task
                        .feedback_history
                        .last()
                        .map(|f| f.feedback.clone())
                        .unwrap_or_default();
                    self.events.emit(ProgressEvent::RefinementStarted {
                        step_index: task.current_step,
                        pass: task.refinements_used,
                    });
                    self.execute_phase(&mut task, &tools, Some(guidance.as_str()))
                        .await?;
                }
                Phase::Feedback => {
                    self.feedback_phase(&mut task, &tools, reference_image.as_deref())
                        .await?;
                }
                Phase::QualityGate => {
                    self.quality_gate_phase(&mut task).await;
                }
                Phase::Evaluate => {
                    self.evaluate_phase(&mut task);
                }
                Phase::Replan => {
                    self.replan_phase(&mut task, &tools, reference_image.as_deref())
                        .await?;
                }
                Phase::Complete | Phase::Failed | Phase::Cancelled => {
                    let status = self.status_of(&task);
                    self.events.emit(ProgressEvent::TaskFinished {
                        status,
                        steps_completed: task.current_step,
                    });
                    let can_resume = matches!(status, TaskStatus::Cancelled);
                    return Ok(self.result_for(&task, status, can_resume));
                }
                Phase::Init | Phase::Plan => {
                    // Planning happens before the loop; reaching these
                    // here means a restored checkpoint predates the plan.
                    task.phase = Phase::Execute;
                }
            }
        }
    }

    async fn restore(&self, key: &str, resume: bool) -> Result<Option<Task>, EngineError> {
        if !resume {
            return Ok(None);
        }
        let restored = self.checkpoints.latest(key).await?;
        if let Some(task) = &restored {
            tracing::info!(
                session_key = %key,
                step = task.current_step,
                "restored checkpoint"
            );
        }
        Ok(restored)
    }

    async fn load_reference(&self, goal: &Goal) -> Result<Option<String>, EngineError> {
        match goal {
            Goal::Image { path } => {
                let bytes = tokio::fs::read(path).await?;
                Ok(Some(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                ))
            }
            Goal::Brief { .. } => Ok(None),
        }
    }

    /// Plan, then (on resume) detect and skip already-completed steps.
    async fn plan_phase(
        &self,
        task: &mut Task,
        tools: &[ToolSchema],
        reference_image: Option<&str>,
        resume: bool,
    ) -> Result<(), EngineError> {
        task.phase = Phase::Plan;
        let prior: Vec<String> = task
            .feedback_history
            .iter()
            .rev()
            .take(PLANNING_FEEDBACK_WINDOW)
            .map(|f| f.feedback.clone())
            .collect();

        task.plan = self
            .planner
            .plan(&task.goal, reference_image, &prior)
            .await?;

        let mut skipped = 0;
        if resume {
            let snapshot = self.inspect_environment(tools).await;
            let completed = self
                .planner
                .detect_completed_steps(&task.plan, &snapshot)
                .await?;
            if let Some(highest) = completed.iter().max().copied() {
                for index in &completed {
                    if let Some(step) = task.plan.get_mut(*index) {
                        step.completed = true;
                    }
                }
                skipped = completed.len();
                task.completed_steps = completed;
                task.current_step = highest + 1;
                tracing::info!(skipped, start = task.current_step, "skipping completed steps");
            }
        }

        self.events.emit(ProgressEvent::PlanCreated {
            steps: task.plan.iter().map(|s| s.text.clone()).collect(),
            skipped,
        });

        task.phase = Phase::Execute;
        self.save_checkpoint(task).await;
        Ok(())
    }

    async fn inspect_environment(&self, tools: &[ToolSchema]) -> EnvironmentSnapshot {
        let scene_tool = tools
            .iter()
            .find(|t| t.name == "get_scene_info")
            .or_else(|| tools.iter().find(|t| t.name.to_lowercase().contains("scene")));
        let Some(tool) = scene_tool else {
            return EnvironmentSnapshot::default();
        };
        match self
            .tool_client
            .call_tool(&tool.name, serde_json::json!({}))
            .await
        {
            Ok(outcome) if outcome.success => EnvironmentSnapshot::from_scene_info(&outcome.result),
            Ok(outcome) => {
                tracing::warn!("scene inspection failed: {}", outcome.result);
                EnvironmentSnapshot::default()
            }
            Err(e) => {
                tracing::warn!("scene inspection failed: {}", e);
                EnvironmentSnapshot::default()
            }
        }
    }

    /// Execute (or re-execute with guidance) the current step.
    async fn execute_phase(
        &self,
        task: &mut Task,
        tools: &[ToolSchema],
        guidance: Option<&str>,
    ) -> Result<(), EngineError> {
        let index = task.current_step;
        let step_text = task.current_step_text().unwrap_or_default().to_string();
        if guidance.is_none() {
            self.events.emit(ProgressEvent::StepStarted {
                index,
                total: task.plan.len(),
                text: step_text.clone(),
            });
        }

        let prior: Vec<String> = task
            .feedback_history
            .iter()
            .rev()
            .take(PLANNING_FEEDBACK_WINDOW)
            .map(|f| f.feedback.clone())
            .collect();
        let execution = self
            .executor
            .execute(
                self.tool_client.as_ref(),
                tools,
                &task.goal.describe(),
                index,
                &step_text,
                &prior,
                guidance,
                &self.events,
            )
            .await?;

        task.tool_results.extend(execution.records);
        task.execution_errors.extend(execution.errors);

        if let Some(fatal) = execution.fatal {
            tracing::error!(step = index, "critical error: {}", fatal);
            self.events.emit(ProgressEvent::Error {
                message: fatal.clone(),
            });
            task.critical_error = Some(fatal);
            task.phase = Phase::Failed;
            self.save_checkpoint(task).await;
        } else {
            task.phase = Phase::Feedback;
        }
        Ok(())
    }

    async fn feedback_phase(
        &self,
        task: &mut Task,
        tools: &[ToolSchema],
        reference_image: Option<&str>,
    ) -> Result<(), EngineError> {
        let index = task.current_step;
        let step_text = task.current_step_text().unwrap_or_default().to_string();

        match self
            .capturer
            .capture(
                self.tool_client.as_ref(),
                tools,
                &task.session_key,
                &task.goal,
                reference_image,
                index,
                &step_text,
                task.refinements_used,
            )
            .await
        {
            Ok(result) => {
                self.events.emit(ProgressEvent::ScreenshotCaptured {
                    path: result.artifact.clone(),
                });
                task.tool_results.push(result.record);
                task.refinements_used += 1;
                task.feedback_history.push(StepFeedback {
                    step_index: index,
                    score: result.score,
                    feedback: result.feedback,
                    refinement: task.refinements_used - 1,
                });
                task.phase = Phase::QualityGate;
            }
            Err(EngineError::Llm(e)) => return Err(EngineError::Llm(e)),
            Err(e) => {
                // Capture problems (missing tool, bad artifact, transport)
                // never sink the run: record and move on with the step
                // accepted as-is.
                tracing::warn!(step = index, "feedback capture failed: {}", e);
                task.execution_errors.push(format!("feedback: {}", e));
                self.advance_step(task).await;
            }
        }
        Ok(())
    }

    async fn quality_gate_phase(&self, task: &mut Task) {
        let index = task.current_step;
        let Some(last) = task.feedback_history.last() else {
            task.phase = Phase::Execute;
            return;
        };
        let assessment =
            self.gate
                .assess(&last.feedback, last.score, index, task.refinements_used);
        self.events.emit(ProgressEvent::QualityAssessed {
            step_index: index,
            score: assessment.score,
            accepted: assessment.accepted,
        });

        if assessment.accepted {
            self.advance_step(task).await;
        } else {
            task.phase = Phase::Refine;
        }
    }

    async fn advance_step(&self, task: &mut Task) {
        task.refinements_used = 0;
        task.current_step += 1;
        task.phase = Phase::Execute;
        self.save_checkpoint(task).await;
    }

    /// All planned steps are done. Image goals whose recent scores run low
    /// get another planning round (bounded); everything else completes.
    fn evaluate_phase(&self, task: &mut Task) {
        if task.goal.is_image() {
            if let Some(mean) = task.mean_recent_score(REPLAN_SCORE_WINDOW) {
                if mean < REPLAN_MEAN_THRESHOLD
                    && task.replan_attempts < self.max_replanning_attempts
                {
                    task.phase = Phase::Replan;
                    return;
                }
            }
        }
        task.phase = Phase::Complete;
    }

    /// Extend the plan with corrective steps derived from recent feedback.
    /// Appending (rather than replacing) keeps `current_step` monotonic.
    async fn replan_phase(
        &self,
        task: &mut Task,
        _tools: &[ToolSchema],
        reference_image: Option<&str>,
    ) -> Result<(), EngineError> {
        task.replan_attempts += 1;
        let mean = task.mean_recent_score(REPLAN_SCORE_WINDOW).unwrap_or(0.0);
        self.events.emit(ProgressEvent::Replanning {
            attempt: task.replan_attempts,
            mean_score: mean,
        });
        tracing::info!(
            attempt = task.replan_attempts,
            mean_score = mean,
            "replanning to close quality gap"
        );

        let prior: Vec<String> = task
            .feedback_history
            .iter()
            .rev()
            .take(PLANNING_FEEDBACK_WINDOW)
            .map(|f| f.feedback.clone())
            .collect();
        let corrective = self
            .planner
            .plan(&task.goal, reference_image, &prior)
            .await?;

        let base = task.plan.len();
        for (offset, mut step) in corrective.into_iter().enumerate() {
            step.index = base + offset;
            task.plan.push(step);
        }
        task.phase = Phase::Execute;
        self.save_checkpoint(task).await;
        Ok(())
    }

    /// Iteration cap reached: report the latest checkpoint as a resumable
    /// partial result, or the initial state when no checkpoint exists.
    async fn suspend_at_cap(&self, task: &Task) -> Result<TaskResult, EngineError> {
        tracing::warn!(
            iterations = task.iterations,
            "iteration cap reached, suspending"
        );
        let snapshot = self
            .checkpoints
            .latest(&task.session_key)
            .await?
            .unwrap_or_else(|| task.clone());
        self.events.emit(ProgressEvent::TaskFinished {
            status: TaskStatus::PartialCompletion,
            steps_completed: snapshot.current_step,
        });
        Ok(self.result_for(&snapshot, TaskStatus::PartialCompletion, true))
    }

    async fn save_checkpoint(&self, task: &Task) {
        // Checkpointing is best-effort: a failed write degrades resume
        // but must not interrupt the run.
        match self
            .checkpoints
            .put(&task.session_key, task.current_step, task)
            .await
        {
            Ok(()) => self.events.emit(ProgressEvent::CheckpointSaved {
                step_index: task.current_step,
            }),
            Err(e) => tracing::warn!("checkpoint write failed: {}", e),
        }
    }

    fn status_of(&self, task: &Task) -> TaskStatus {
        match task.phase {
            Phase::Complete => TaskStatus::Completed,
            Phase::Cancelled => TaskStatus::Cancelled,
            Phase::Failed => TaskStatus::Failed,
            phase => {
                // Only terminal phases have a status; callers hold that
                // invariant, so a mid-run phase here is a caller bug.
                debug_assert!(phase.is_terminal(), "status requested in phase {:?}", phase);
                TaskStatus::Completed
            }
        }
    }

    fn result_for(&self, task: &Task, status: TaskStatus, can_resume: bool) -> TaskResult {
        let screenshots_captured = task
            .tool_results
            .iter()
            .filter(|r| r.artifact.is_some())
            .count();
        TaskResult {
            task_id: task.id,
            session_key: task.session_key.clone(),
            status,
            steps_executed: task.current_step.saturating_sub(task.completed_steps.len()),
            total_steps: task.plan.len(),
            screenshots_captured,
            quality_scores: task.feedback_history.iter().map(|f| f.score).collect(),
            final_score: task.latest_score(),
            screenshot_directory: self.screenshots_root.join(&task.session_key),
            execution_errors: task.execution_errors.clone(),
            error: task.critical_error.clone(),
            partial_completion: matches!(status, TaskStatus::PartialCompletion),
            can_resume: can_resume || matches!(status, TaskStatus::PartialCompletion),
        }
    }
}

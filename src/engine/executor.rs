//! Step execution: one step description -> ordered tool calls.

use std::time::Duration;

use super::classify::{is_fatal_error, is_tool_error};
use super::events::{EventSink, ProgressEvent};
use super::task::ToolInvocationRecord;
use crate::llm::gateway::ReasoningGateway;
use crate::llm::{LlmError, ToolDefinition};
use crate::rpc::{ToolClient, ToolOutcome, ToolSchema};

const EXECUTION_SYSTEM: &str = "You are operating a 3D content tool through its tool API. \
Execute the given step by calling the available tools. Call as many tools as the step \
needs, in order. Prefer concrete parameter values over defaults.";

/// Result of executing one step.
#[derive(Debug, Default)]
pub struct StepExecution {
    pub records: Vec<ToolInvocationRecord>,
    /// Recoverable error texts observed during this step
    pub errors: Vec<String>,
    /// Set when a foundational step hit a fatal-pattern error; the run
    /// must halt without executing further invocations
    pub fatal: Option<String>,
}

pub struct StepExecutor {
    reasoning: ReasoningGateway,
    /// Pause after each step to stay under upstream rate limits
    step_delay: Duration,
    critical_cutoff: usize,
}

impl StepExecutor {
    pub fn new(reasoning: ReasoningGateway, step_delay: Duration, critical_cutoff: usize) -> Self {
        Self {
            reasoning,
            step_delay,
            critical_cutoff,
        }
    }

    /// Execute one step. The reasoning model proposes tool invocations in
    /// one turn; they are dispatched strictly in the order returned. A
    /// fatal error on a foundational step stops dispatch immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        tool_client: &dyn ToolClient,
        tools: &[ToolSchema],
        goal_description: &str,
        step_index: usize,
        step_text: &str,
        prior_feedback: &[String],
        guidance: Option<&str>,
        events: &EventSink,
    ) -> Result<StepExecution, LlmError> {
        let mut prompt = format!(
            "Overall goal: {}\n\nCurrent step to execute: {}\n",
            goal_description, step_text
        );
        if !prior_feedback.is_empty() {
            prompt.push_str("\nRecent feedback on the scene:\n");
            for entry in prior_feedback {
                prompt.push_str("- ");
                prompt.push_str(entry);
                prompt.push('\n');
            }
        }
        if let Some(guidance) = guidance {
            prompt.push_str("\nThis step was already attempted. Address this feedback:\n");
            prompt.push_str(guidance);
            prompt.push_str(
                "\nIf anything is hidden, occluded, or blocked, reposition it so it is \
                 clearly visible. Adjust the existing work; do not delete and rebuild it.\n",
            );
        }

        let definitions: Vec<ToolDefinition> = tools.iter().map(ToolDefinition::from).collect();
        let (invocations, text) = self
            .reasoning
            .propose_tool_calls(Some(EXECUTION_SYSTEM), &prompt, &definitions)
            .await?;

        if invocations.is_empty() {
            tracing::debug!(step_index, response = %text, "model proposed no tool calls");
        }

        let mut execution = StepExecution::default();
        for invocation in invocations {
            let outcome = match tool_client
                .call_tool(&invocation.name, invocation.input.clone())
                .await
            {
                Ok(outcome) => outcome,
                // Transport failures are recorded like tool failures so
                // the step's error history stays in one place.
                Err(e) => ToolOutcome::failure(e.to_string()),
            };

            let errored = !outcome.success || is_tool_error(&outcome.result);
            events.emit(ProgressEvent::ToolCalled {
                tool: invocation.name.clone(),
                success: !errored,
            });

            execution.records.push(ToolInvocationRecord {
                step_index,
                tool: invocation.name.clone(),
                params: invocation.input,
                success: !errored,
                result: outcome.result.clone(),
                artifact: None,
            });

            if errored {
                let message = format!("{}: {}", invocation.name, outcome.result);
                tracing::warn!(step_index, tool = %invocation.name, "tool call failed: {}", outcome.result);
                if is_fatal_error(&outcome.result, step_index, self.critical_cutoff) {
                    execution.fatal = Some(message);
                    return Ok(execution);
                }
                execution.errors.push(message);
            }
        }

        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        Ok(execution)
    }
}

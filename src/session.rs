//! Session identity and the registry of running tasks.
//!
//! The session key is derived deterministically from the goal, so
//! resubmitting the same brief or image path always maps back to the same
//! resumable session. The registry replaces any ambient global state:
//! callers hold it explicitly and look tasks up by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::engine::events::ProgressEvent;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::task::{Goal, TaskResult, TaskStatus};

/// Hex length of a session key.
const SESSION_KEY_LEN: usize = 16;
/// Recent progress messages kept per task.
const MESSAGE_WINDOW: usize = 50;

/// Derive the session key for a goal: SHA-256 of its canonical reference,
/// truncated to 16 hex characters.
pub fn session_key(goal: &Goal) -> String {
    let reference = match goal {
        Goal::Brief { text } => text.as_str().as_bytes().to_vec(),
        Goal::Image { path } => path.to_string_lossy().as_bytes().to_vec(),
    };
    let digest = Sha256::digest(&reference);
    hex::encode(digest)[..SESSION_KEY_LEN].to_string()
}

/// Externally visible progress of one task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatus {
    pub steps_executed: usize,
    pub total_steps: usize,
    pub screenshots_captured: usize,
    pub progress_percent: f32,
    /// Recent human-readable progress messages, oldest first
    pub messages: Vec<String>,
    pub finished: Option<TaskStatus>,
    pub error: Option<String>,
}

/// Handle to a running (or finished) task: cancellation flag, live status
/// built from progress events, and the final result once available.
pub struct TaskHandle {
    pub task_id: Uuid,
    pub session_key: String,
    cancel: Arc<AtomicBool>,
    status: Mutex<SessionStatus>,
    result: Mutex<Option<TaskResult>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    fn new(session_key: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            session_key,
            cancel: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(SessionStatus::default()),
            result: Mutex::new(None),
            join: Mutex::new(None),
        }
    }

    /// Wait for a task spawned through [`SessionRegistry::start`] to
    /// finish, then return its result.
    pub async fn wait(&self) -> Option<TaskResult> {
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.result()
    }

    /// The flag the orchestrator polls at each `Execute` entry.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_result(&self, result: TaskResult) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fold one progress event into the visible status.
    pub fn apply_event(&self, event: &ProgressEvent) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            ProgressEvent::TaskStarted { goal, .. } => {
                push_message(&mut status, format!("Task started: {}", goal));
            }
            ProgressEvent::PlanCreated { steps, skipped } => {
                status.total_steps = steps.len();
                status.steps_executed = 0;
                push_message(
                    &mut status,
                    format!("Plan created: {} steps ({} skipped)", steps.len(), skipped),
                );
            }
            ProgressEvent::StepStarted { index, total, text } => {
                status.total_steps = *total;
                push_message(&mut status, format!("Step {}/{}: {}", index + 1, total, text));
            }
            ProgressEvent::ToolCalled { tool, success } => {
                if !success {
                    push_message(&mut status, format!("Tool {} reported an error", tool));
                }
            }
            ProgressEvent::ScreenshotCaptured { path } => {
                status.screenshots_captured += 1;
                push_message(&mut status, format!("Screenshot: {}", path.display()));
            }
            ProgressEvent::QualityAssessed {
                step_index,
                score,
                accepted,
            } => {
                if *accepted {
                    status.steps_executed = step_index + 1;
                }
                if status.total_steps > 0 {
                    status.progress_percent =
                        (status.steps_executed as f32 / status.total_steps as f32) * 100.0;
                }
                push_message(
                    &mut status,
                    format!(
                        "Step {} scored {}/100 ({})",
                        step_index + 1,
                        score,
                        if *accepted { "accepted" } else { "refining" }
                    ),
                );
            }
            ProgressEvent::RefinementStarted { step_index, pass } => {
                push_message(
                    &mut status,
                    format!("Refining step {} (pass {})", step_index + 1, pass),
                );
            }
            ProgressEvent::Replanning { attempt, mean_score } => {
                push_message(
                    &mut status,
                    format!(
                        "Replanning (attempt {}, recent mean {:.0})",
                        attempt, mean_score
                    ),
                );
            }
            ProgressEvent::CheckpointSaved { .. } => {}
            ProgressEvent::TaskFinished {
                status: task_status,
                steps_completed,
            } => {
                status.finished = Some(*task_status);
                status.steps_executed = *steps_completed;
                push_message(&mut status, format!("Task finished: {:?}", task_status));
            }
            ProgressEvent::Error { message } => {
                status.error = Some(message.clone());
                push_message(&mut status, format!("Error: {}", message));
            }
        }
    }
}

fn push_message(status: &mut SessionStatus, message: String) {
    status.messages.push(message);
    if status.messages.len() > MESSAGE_WINDOW {
        let overflow = status.messages.len() - MESSAGE_WINDOW;
        status.messages.drain(..overflow);
    }
}

/// Registry of task handles, keyed by task id. One per process; shared by
/// reference with whatever layer submits and polls tasks.
#[derive(Default)]
pub struct SessionRegistry {
    tasks: Mutex<HashMap<Uuid, Arc<TaskHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handle for the session.
    pub fn create(&self, session_key: String) -> Arc<TaskHandle> {
        let handle = Arc::new(TaskHandle::new(session_key));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.task_id, handle.clone());
        handle
    }

    /// Submit a task: registers a handle, spawns the run on the runtime,
    /// and feeds progress events into the handle's status. The returned
    /// handle exposes `status()`, `cancel()`, and `wait()`.
    pub fn start(
        &self,
        orchestrator: Orchestrator,
        mut events: UnboundedReceiver<ProgressEvent>,
        goal: Goal,
        resume: bool,
    ) -> Arc<TaskHandle> {
        let handle = self.create(session_key(&goal));

        let status_handle = handle.clone();
        let event_pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                status_handle.apply_event(&event);
            }
        });

        let run_handle = handle.clone();
        let join = tokio::spawn(async move {
            let cancel = run_handle.cancel_flag();
            let outcome = orchestrator.run(goal, resume, cancel).await;
            // Dropping the orchestrator closes the event channel so the
            // pump drains the queue and exits.
            drop(orchestrator);
            let _ = event_pump.await;
            match outcome {
                Ok(result) => run_handle.set_result(result),
                Err(e) => run_handle.apply_event(&ProgressEvent::Error {
                    message: e.to_string(),
                }),
            }
        });
        *handle.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        handle
    }

    /// Progress of a task, if known.
    pub fn status(&self, task_id: &Uuid) -> Option<SessionStatus> {
        self.get(task_id).map(|handle| handle.status())
    }

    pub fn get(&self, task_id: &Uuid) -> Option<Arc<TaskHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    pub fn remove(&self, task_id: &Uuid) -> Option<Arc<TaskHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
    }

    /// Request cooperative cancellation. Returns false for unknown ids.
    pub fn cancel(&self, task_id: &Uuid) -> bool {
        match self.get(task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn session_key_is_deterministic() {
        let goal = Goal::Brief {
            text: "a stone bridge over a river".to_string(),
        };
        let a = session_key(&goal);
        let b = session_key(&goal);
        assert_eq!(a, b);
        assert_eq!(a.len(), SESSION_KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_key_differs_per_goal() {
        let brief = Goal::Brief {
            text: "a bridge".to_string(),
        };
        let image = Goal::Image {
            path: PathBuf::from("ref/bridge.png"),
        };
        assert_ne!(session_key(&brief), session_key(&image));
    }

    #[test]
    fn registry_lifecycle() {
        let registry = SessionRegistry::new();
        let handle = registry.create("abc".to_string());
        let id = handle.task_id;

        assert!(registry.get(&id).is_some());
        assert!(registry.cancel(&id));
        assert!(handle.is_cancelled());

        registry.remove(&id);
        assert!(registry.get(&id).is_none());
        assert!(!registry.cancel(&id));
    }

    #[test]
    fn events_build_status() {
        let handle = TaskHandle::new("abc".to_string());
        handle.apply_event(&ProgressEvent::PlanCreated {
            steps: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            skipped: 0,
        });
        handle.apply_event(&ProgressEvent::QualityAssessed {
            step_index: 0,
            score: 82,
            accepted: true,
        });

        let status = handle.status();
        assert_eq!(status.total_steps, 4);
        assert_eq!(status.steps_executed, 1);
        assert!((status.progress_percent - 25.0).abs() < f32::EPSILON);
        assert!(status.messages.iter().any(|m| m.contains("82/100")));
    }
}

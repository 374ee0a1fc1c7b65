//! Progress events emitted by the orchestrator.
//!
//! Consumers (CLI display, logs, future UIs) subscribe through an
//! unbounded channel; emission never blocks the engine and a missing
//! subscriber is fine.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::task::TaskStatus;

/// Events describing task progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TaskStarted {
        task_id: Uuid,
        session_key: String,
        goal: String,
    },
    PlanCreated {
        steps: Vec<String>,
        /// Steps skipped because resumption found them already done
        skipped: usize,
    },
    StepStarted {
        index: usize,
        total: usize,
        text: String,
    },
    ToolCalled {
        tool: String,
        success: bool,
    },
    ScreenshotCaptured {
        path: PathBuf,
    },
    QualityAssessed {
        step_index: usize,
        score: u8,
        accepted: bool,
    },
    RefinementStarted {
        step_index: usize,
        pass: u32,
    },
    Replanning {
        attempt: u32,
        mean_score: f64,
    },
    CheckpointSaved {
        step_index: usize,
    },
    TaskFinished {
        status: TaskStatus,
        steps_completed: usize,
    },
    Error {
        message: String,
    },
}

/// Fire-and-forget event emitter. Cloneable; all clones feed one channel.
#[derive(Clone)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl EventSink {
    /// Sink backed by a channel; the receiver side is returned to the caller.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Sink that drops every event.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            // A dropped receiver just means nobody is listening anymore.
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_through_channel() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(ProgressEvent::StepStarted {
            index: 0,
            total: 5,
            text: "Create the base".to_string(),
        });
        match rx.recv().await.unwrap() {
            ProgressEvent::StepStarted { index, total, .. } => {
                assert_eq!(index, 0);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn disabled_sink_swallows_events() {
        let sink = EventSink::disabled();
        sink.emit(ProgressEvent::Error {
            message: "ignored".to_string(),
        });
    }
}

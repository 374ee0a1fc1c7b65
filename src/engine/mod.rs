//! The task orchestration engine.
//!
//! Component layering, leaves first: [`classify`] (pure text heuristics),
//! [`planner`], [`executor`], [`feedback`], [`quality`], and the
//! [`orchestrator`] state machine tying them together. Task state lives
//! in [`task`]; progress reporting in [`events`].

pub mod classify;
pub mod events;
pub mod executor;
pub mod feedback;
pub mod orchestrator;
pub mod planner;
pub mod quality;
pub mod task;

use thiserror::Error;

/// Errors surfaced by engine components to the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),

    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),

    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No {0} tool available from the controlled application")]
    MissingTool(String),

    #[error("Feedback capture failed: {0}")]
    Capture(String),
}

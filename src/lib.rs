//! # Artisan
//!
//! Task orchestration engine for an autonomous agent that builds 3D
//! scenes in an external content tool. A goal (text brief or reference
//! image) is turned into an ordered plan, each step is executed through
//! the tool's JSON RPC endpoint, a vision model scores screenshots of the
//! result, and a quality gate decides whether to accept, refine, or
//! replan. Runs are checkpointed at step boundaries and can resume after
//! crashes, cancellation, or hitting the iteration cap.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌───────────────────┐
//!                 │    Orchestrator   │  state machine, checkpoints
//!                 └─┬────┬────┬────┬──┘
//!            ┌──────┘    │    │    └────────┐
//!            ▼           ▼    ▼             ▼
//!       ┌─────────┐ ┌────────┐ ┌─────────┐ ┌─────────────┐
//!       │ Planner │ │Executor│ │Feedback │ │ QualityGate │
//!       └────┬────┘ └───┬────┘ │Capturer │ └─────────────┘
//!            │          │      └──┬───┬──┘
//!            ▼          ▼         │   ▼
//!      ┌───────────────────┐      │ ┌───────────────┐
//!      │ Reasoning Gateway │      └▶│Vision Gateway │
//!      └─────────┬─────────┘        └───────┬───────┘
//!                └───────── LlmClient ──────┘
//!
//!       tool calls: Executor / FeedbackCapturer ──▶ ToolClient (RPC)
//! ```
//!
//! ## Modules
//! - `engine`: planner, step executor, feedback capturer, quality gate,
//!   and the orchestrator state machine
//! - `llm`: model client trait, Anthropic implementation, retrying gateways
//! - `rpc`: JSON tool-call client for the controlled application
//! - `checkpoint`: durable task snapshots for resumption
//! - `session`: deterministic session keys and the task registry

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod llm;
pub mod rpc;
pub mod session;

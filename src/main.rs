//! artisan - CLI entry point.
//!
//! Runs one orchestration task against the configured tool endpoint:
//! `artisan [--resume] --image <path>` or `artisan [--resume] <brief...>`.

use std::path::PathBuf;
use std::sync::Arc;

use artisan::checkpoint::FileCheckpointStore;
use artisan::config::Config;
use artisan::engine::events::EventSink;
use artisan::engine::orchestrator::Orchestrator;
use artisan::engine::task::{Goal, TaskStatus};
use artisan::llm::AnthropicClient;
use artisan::rpc::StdioToolClient;
use artisan::session::SessionRegistry;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn parse_args() -> Result<(Goal, bool), String> {
    let mut resume = false;
    let mut image: Option<PathBuf> = None;
    let mut brief_parts: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--resume" => resume = true,
            "--image" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--image requires a path".to_string())?;
                image = Some(PathBuf::from(path));
            }
            other => brief_parts.push(other.to_string()),
        }
    }

    let goal = match (image, brief_parts.is_empty()) {
        (Some(path), true) => Goal::Image { path },
        (None, false) => Goal::Brief {
            text: brief_parts.join(" "),
        },
        (Some(_), false) => {
            return Err("provide either --image or a brief, not both".to_string())
        }
        (None, true) => {
            return Err("usage: artisan [--resume] (--image <path> | <brief text>)".to_string())
        }
    };
    Ok((goal, resume))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artisan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (goal, resume) = match parse_args() {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config = Config::from_env()?;
    info!(
        reasoning = %config.reasoning_model,
        vision = %config.vision_model,
        "configuration loaded"
    );

    let llm = Arc::new(AnthropicClient::new(config.api_key.clone()));
    let tool_client = Arc::new(StdioToolClient::spawn(
        &config.rpc_command,
        &config.rpc_args,
        config.tool_call_timeout,
    )?);
    let checkpoints = Arc::new(FileCheckpointStore::new(config.data_dir.join("checkpoints")));

    let (events, event_rx) = EventSink::channel();
    let orchestrator = Orchestrator::new(&config, llm, tool_client, checkpoints, events);

    let registry = SessionRegistry::new();
    let handle = registry.start(orchestrator, event_rx, goal, resume);
    info!(task_id = %handle.task_id, session_key = %handle.session_key, "task started");

    // Ctrl-C requests cooperative cancellation; the run checkpoints and
    // stops at the next step boundary.
    let interrupt_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling task");
            interrupt_handle.cancel();
        }
    });

    let Some(result) = handle.wait().await else {
        let status = handle.status();
        error!(
            "task did not produce a result: {}",
            status.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    };

    info!(
        status = ?result.status,
        steps = result.steps_executed,
        total = result.total_steps,
        screenshots = result.screenshots_captured,
        final_score = ?result.final_score,
        "run finished"
    );
    if !result.execution_errors.is_empty() {
        info!(
            "recoverable errors during run: {}",
            result.execution_errors.join("; ")
        );
    }

    match result.status {
        TaskStatus::Completed => Ok(()),
        TaskStatus::PartialCompletion => {
            info!("iteration cap reached; rerun with --resume to continue");
            Ok(())
        }
        TaskStatus::Cancelled => {
            info!("task cancelled; rerun with --resume to continue");
            Ok(())
        }
        TaskStatus::Failed => {
            if let Some(message) = &result.error {
                error!("task failed: {}", message);
            }
            std::process::exit(1);
        }
    }
}

//! Configuration management for the Artisan engine.
//!
//! Configuration can be set via environment variables:
//! - `ANTHROPIC_API_KEY` - Required. API key for the reasoning/vision models.
//! - `REASONING_MODEL` - Optional. Planning/acting model. Defaults to `claude-sonnet-4-5-20250929`.
//! - `VISION_MODEL` - Optional. Screenshot-judging model. Defaults to `claude-sonnet-4-20250514`.
//! - `RATE_LIMIT_MAX_RETRIES` - Optional. Gateway retry cap. Defaults to `5`.
//! - `RATE_LIMIT_BASE_WAIT` - Optional. Base backoff wait in seconds. Defaults to `15`.
//! - `STEP_DELAY_SECS` - Optional. Delay between steps in seconds. Defaults to `2`.
//! - `MAX_ITERATIONS` - Optional. State-machine transition cap. Defaults to `100`.
//! - `REFINEMENT_STEPS` - Optional. Max refinement attempts per step. Defaults to `2`.
//! - `MAX_REPLANNING_ATTEMPTS` - Optional. Replan cap for image goals. Defaults to `2`.
//! - `CRITICAL_STEP_CUTOFF` - Optional. Steps below this index are foundational. Defaults to `5`.
//! - `TOOL_CALL_TIMEOUT_SECS` - Optional. Per tool call timeout. Defaults to `30`.
//! - `DATA_DIR` - Optional. Root for screenshots and checkpoints. Defaults to `data`.
//! - `RPC_COMMAND` / `RPC_ARGS` - Optional. Command spawning the controlled
//!   application's tool endpoint. Defaults to `python main.py`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Retry/pacing configuration shared by both model gateways.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum retries after a rate-limit-classified error
    pub max_retries: u32,

    /// Base wait; attempt n sleeps `base_wait * 2^n`
    pub base_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_wait: Duration::from_secs(15),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the model provider
    pub api_key: String,

    /// Model used for planning and tool selection
    pub reasoning_model: String,

    /// Model used for screenshot comparison
    pub vision_model: String,

    /// Gateway retry behavior
    pub rate_limit: RateLimitConfig,

    /// Delay applied after each step's tool dispatch
    pub step_delay: Duration,

    /// State-machine transition cap before graceful suspension
    pub max_iterations: usize,

    /// Refinement attempts allowed per step before forced accept
    pub max_refinements_per_step: u32,

    /// Replanning passes allowed for image-driven goals
    pub max_replanning_attempts: u32,

    /// Steps with index below this are foundational (fail-fast on fatal errors)
    pub critical_step_cutoff: usize,

    /// Timeout for a single RPC tool call
    pub tool_call_timeout: Duration,

    /// Root directory for screenshots and checkpoints
    pub data_dir: PathBuf,

    /// Command used to spawn the controlled application's tool endpoint
    pub rpc_command: String,

    /// Arguments for `rpc_command`
    pub rpc_args: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `ANTHROPIC_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let reasoning_model = std::env::var("REASONING_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5-20250929".to_string());

        let vision_model = std::env::var("VISION_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        let rate_limit = RateLimitConfig {
            max_retries: env_parse("RATE_LIMIT_MAX_RETRIES", 5u32)?,
            base_wait: Duration::from_secs(env_parse("RATE_LIMIT_BASE_WAIT", 15u64)?),
        };

        let step_delay = Duration::from_secs(env_parse("STEP_DELAY_SECS", 2u64)?);
        let max_iterations = env_parse("MAX_ITERATIONS", 100usize)?;
        let max_refinements_per_step = env_parse("REFINEMENT_STEPS", 2u32)?;
        let max_replanning_attempts = env_parse("MAX_REPLANNING_ATTEMPTS", 2u32)?;
        let critical_step_cutoff = env_parse("CRITICAL_STEP_CUTOFF", 5usize)?;
        let tool_call_timeout = Duration::from_secs(env_parse("TOOL_CALL_TIMEOUT_SECS", 30u64)?);

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let rpc_command = std::env::var("RPC_COMMAND").unwrap_or_else(|_| "python".to_string());
        let rpc_args = std::env::var("RPC_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|_| vec!["main.py".to_string()]);

        Ok(Self {
            api_key,
            reasoning_model,
            vision_model,
            rate_limit,
            step_delay,
            max_iterations,
            max_refinements_per_step,
            max_replanning_attempts,
            critical_step_cutoff,
            tool_call_timeout,
            data_dir,
            rpc_command,
            rpc_args,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, data_dir: PathBuf) -> Self {
        Self {
            api_key,
            reasoning_model: "claude-sonnet-4-5-20250929".to_string(),
            vision_model: "claude-sonnet-4-20250514".to_string(),
            rate_limit: RateLimitConfig::default(),
            step_delay: Duration::from_secs(2),
            max_iterations: 100,
            max_refinements_per_step: 2,
            max_replanning_attempts: 2,
            critical_step_cutoff: 5,
            tool_call_timeout: Duration::from_secs(30),
            data_dir,
            rpc_command: "python".to_string(),
            rpc_args: vec!["main.py".to_string()],
        }
    }
}

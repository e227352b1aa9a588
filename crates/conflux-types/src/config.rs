//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so an empty or missing file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How layered contexts are presented to the expression evaluator.
    #[serde(default)]
    pub context_strategy: ContextStrategy,

    /// Maximum parent hops when resolving a sub-workflow's environment.
    #[serde(default = "default_max_env_depth")]
    pub max_env_depth: usize,

    #[serde(default)]
    pub transaction: TransactionConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_max_env_depth() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_strategy: ContextStrategy::default(),
            max_env_depth: default_max_env_depth(),
            transaction: TransactionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Layered-context evaluation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Read-through view over the layers, first match wins. No copying.
    #[default]
    Precedence,
    /// Eagerly deep-merge all layers into one map.
    Merge,
}

/// Retry policy for transactions that hit transient storage errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    1_000
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Liveness checking for asynchronous actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between checker sweeps. Zero disables the checker.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Missed intervals after which a running async action is failed.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
    /// Actions failed per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_check_interval_secs() -> u64 {
    20
}

fn default_max_missed() -> u32 {
    15
}

fn default_batch_size() -> usize {
    10
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_missed: default_max_missed(),
            batch_size: default_batch_size(),
        }
    }
}

impl HeartbeatConfig {
    /// How long an async action may go without a heartbeat.
    pub fn expiry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs * u64::from(self.max_missed))
    }
}

/// Polling of persisted delayed work (task policies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Milliseconds between polls. Zero disables the poller.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs claimed per poll.
    #[serde(default = "default_job_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_job_batch_size() -> usize {
    50
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_job_batch_size(),
        }
    }
}

//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over its store and executor; AppState pins it to
//! the SQLite store and the in-process executor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conflux_core::engine::{spawn_heartbeat_checker, spawn_job_scheduler, Engine};
use conflux_infra::config::{load_engine_config, resolve_data_dir};
use conflux_infra::executor::{run_completion_loop, ActionCompletion, LocalExecutor};
use conflux_infra::sqlite::{database_url, DatabasePool, SqliteExecutionStore};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Engine type pinned to the infra implementations.
pub type ConcreteEngine = Engine<SqliteExecutionStore, LocalExecutor>;

/// Interval at which in-flight local actions report a heartbeat.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub data_dir: PathBuf,
    completions: Mutex<Option<UnboundedReceiver<ActionCompletion>>>,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database
    /// and build the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let pool = DatabasePool::new(&db_url).await?;

        let (executor, completions) = LocalExecutor::new();
        let engine = Engine::new(
            SqliteExecutionStore::new(pool),
            executor,
            LocalExecutor::registry(),
            config,
        );

        Ok(Self {
            engine: Arc::new(engine),
            data_dir,
            completions: Mutex::new(Some(completions)),
        })
    }

    /// Start feeding local action results into the engine, checking
    /// heartbeats and running due policy jobs. Only one set of background
    /// tasks may run per process.
    pub fn start_background(&self) -> anyhow::Result<Background> {
        let completions = self
            .completions
            .lock()
            .map_err(|_| anyhow::anyhow!("completion receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("background tasks already started"))?;

        let cancel = CancellationToken::new();
        let mut handles = vec![tokio::spawn(run_completion_loop(
            Arc::clone(&self.engine),
            completions,
            HEARTBEAT_EVERY,
            cancel.clone(),
        ))];
        handles.extend(spawn_heartbeat_checker(Arc::clone(&self.engine), cancel.clone()));
        handles.extend(spawn_job_scheduler(Arc::clone(&self.engine), cancel.clone()));

        Ok(Background { cancel, handles })
    }
}

/// Handle to the completion loop, heartbeat checker and job scheduler.
pub struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

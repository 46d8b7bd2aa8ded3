pub mod cancel_init;
pub mod init;
pub mod initialize;
pub mod interventions;
pub mod next;
pub mod pause;
pub mod project;
pub mod reset;
pub mod resume;
pub mod roadmap;
pub mod run;
pub mod session;
pub mod status;
pub mod stop;
pub mod sweep;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::runtime::Runtime;

use autopilot::config::Config;
use autopilot::model::StopMode;
use autopilot::orchestrator::Orchestrator;
use autopilot::service::CommandRunner;
use autopilot::service::runner::{ENV_PROJECT_ID, ENV_SESSION_ID};
use autopilot::store::FileStore;

/// Open the store, failing if `autopilot init` has not been run
pub fn open_store(dir: &Path) -> Result<FileStore> {
    let store = FileStore::open(dir);
    if !store.exists() {
        anyhow::bail!("autopilot not initialized. Run 'autopilot init' first.");
    }
    Ok(store)
}

/// Wire up an orchestrator backed by the file store and the configured
/// agent command
pub fn orchestrator(dir: &Path) -> Result<Orchestrator> {
    let store = open_store(dir)?;
    let config = Config::load(dir).context("Failed to load config")?;
    let runner = CommandRunner::new(config.agent.clone(), dir)
        .with_kill_grace(config.orchestrator.stop_grace());
    Ok(Orchestrator::new(Arc::new(store), Arc::new(runner), config))
}

pub fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")
}

/// The session a callback runs under, from `--session` or the
/// environment the runner sets for the agent
pub fn session_id(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(String::from)
        .or_else(|| std::env::var(ENV_SESSION_ID).ok())
        .filter(|s| !s.is_empty())
}

/// The project a callback targets, from the argument or the environment
pub fn project_id(explicit: Option<&str>) -> Result<String> {
    explicit
        .map(String::from)
        .or_else(|| std::env::var(ENV_PROJECT_ID).ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("No project given. Pass --project or set {}.", ENV_PROJECT_ID))
}

/// Await `work`. Ctrl-C turns into an immediate stop of the project and
/// the work is still awaited so the session is settled before exiting.
pub async fn until_done_or_interrupted<T>(
    orch: &Orchestrator,
    project_id: &str,
    work: impl Future<Output = autopilot::Result<T>>,
) -> autopilot::Result<T> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        Ok(()) = tokio::signal::ctrl_c() => {}
    }

    eprintln!("Interrupted, stopping project '{}'...", project_id);
    let stopper = orch.clone();
    let id = project_id.to_string();
    let stop = tokio::spawn(async move { stopper.request_stop(&id, StopMode::Immediate).await });
    let result = work.await;
    match stop.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => eprintln!("Warning: stop failed: {}", e),
        Err(e) => eprintln!("Warning: stop task failed: {}", e),
    }
    result
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

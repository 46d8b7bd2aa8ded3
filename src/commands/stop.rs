use anyhow::Result;
use std::path::Path;

use autopilot::model::StopMode;

use super::{orchestrator, print_json, runtime};

pub fn run(dir: &Path, project_id: &str, immediate: bool, json: bool) -> Result<()> {
    let mode = if immediate {
        StopMode::Immediate
    } else {
        StopMode::AfterCurrent
    };
    let orch = orchestrator(dir)?;
    let outcome = runtime()?.block_on(orch.request_stop(project_id, mode))?;

    if json {
        return print_json(&outcome);
    }
    match (&outcome.session_id, mode) {
        (None, _) => println!("No active session for '{}'; stop recorded", project_id),
        (Some(id), StopMode::AfterCurrent) => {
            println!("Project '{}' will stop after session {} finishes", project_id, id)
        }
        (Some(id), StopMode::Immediate) if outcome.forced => {
            println!("Session {} did not stop in time and was marked interrupted", id)
        }
        (Some(id), StopMode::Immediate) => println!("Session {} stopped", id),
    }
    Ok(())
}

use anyhow::Result;
use std::path::Path;

use super::{orchestrator, print_json};

pub fn run(dir: &Path, project_id: &str, reason: &str, by: &str, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let outcome = orch.interventions().pause_manual(project_id, reason, by)?;

    if json {
        return print_json(&outcome.intervention);
    }
    let i = &outcome.intervention;
    if outcome.created {
        println!("Paused '{}': intervention {} on session {}", project_id, i.id, i.session_id);
    } else {
        println!("Session {} is already paused by intervention {}", i.session_id, i.id);
    }
    Ok(())
}

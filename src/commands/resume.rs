use anyhow::Result;
use std::path::Path;

use autopilot::store::StoreExt;

use super::{orchestrator, print_json};

pub fn run(dir: &Path, intervention_id: &str, by: &str, notes: Option<&str>, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let intervention = orch
        .interventions()
        .resume(intervention_id, by, notes.map(String::from))?;

    if json {
        return print_json(&intervention);
    }
    let project = orch.store().get_project(&intervention.project_id)?;
    println!(
        "Resolved intervention {}; project '{}' is {}",
        intervention.id, project.id, project.phase
    );
    Ok(())
}

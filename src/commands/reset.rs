use anyhow::Result;
use std::path::Path;

use super::{orchestrator, print_json};

pub fn run(dir: &Path, project_id: &str, hard: bool, json: bool) -> Result<()> {
    let project = orchestrator(dir)?.reset(project_id, hard)?;
    if json {
        return print_json(&project);
    }
    println!(
        "Reset '{}'{}; project is {}",
        project.id,
        if hard { " (progress cleared)" } else { "" },
        project.phase
    );
    Ok(())
}

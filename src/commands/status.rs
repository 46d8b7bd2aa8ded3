//! One-screen overview of every project
//!
//! Usage:
//!   autopilot status         # Human-readable output
//!   autopilot status --json  # Machine-readable JSON output

use anyhow::Result;
use std::path::Path;

use super::project::print_status;
use super::{orchestrator, print_json};

pub fn run(dir: &Path, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let statuses = orch
        .list_projects()?
        .iter()
        .map(|p| orch.project_status(&p.id))
        .collect::<autopilot::Result<Vec<_>>>()?;

    if json {
        return print_json(&statuses);
    }
    if statuses.is_empty() {
        println!("No projects. Create one with 'autopilot project add <name>'.");
        return Ok(());
    }
    for (i, status) in statuses.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_status(status);
    }
    Ok(())
}

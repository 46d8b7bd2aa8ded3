use anyhow::Result;
use std::path::Path;

use super::{orchestrator, print_json, runtime};

pub fn run(dir: &Path, project_id: &str, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let report = runtime()?.block_on(orch.cancel_initialization(project_id))?;

    if json {
        return print_json(&report);
    }
    println!(
        "Cancelled initialization of '{}'; removed {} roadmap rows",
        project_id, report.rows_rolled_back
    );
    Ok(())
}

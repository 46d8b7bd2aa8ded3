use anyhow::Result;
use std::path::Path;

use super::{orchestrator, print_json, runtime};

pub fn run(dir: &Path, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let report = runtime()?.block_on(orch.sweep())?;

    if json {
        return print_json(&report);
    }
    if report.interrupted.is_empty() && report.projects_reset.is_empty() {
        println!("No orphaned sessions");
        return Ok(());
    }
    for id in &report.interrupted {
        println!("Interrupted orphaned session {}", id);
    }
    for id in &report.projects_reset {
        println!("Reset phase of project {}", id);
    }
    if report.rows_rolled_back > 0 {
        println!("Rolled back {} roadmap rows", report.rows_rolled_back);
    }
    if !report.processes_terminated.is_empty() {
        println!("Terminated processes: {:?}", report.processes_terminated);
    }
    Ok(())
}

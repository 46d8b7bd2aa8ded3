use anyhow::Result;
use std::path::Path;

use autopilot::model::ProjectPhase;
use autopilot::orchestrator::SessionEnd;

use super::{orchestrator, print_json, runtime, until_done_or_interrupted};

pub fn run(dir: &Path, project_id: &str, force: bool, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let rt = runtime()?;

    let report = rt.block_on(async {
        if let Some(sweep) = orch.startup_sweep().await?
            && !sweep.interrupted.is_empty()
        {
            eprintln!("Swept {} orphaned session(s)", sweep.interrupted.len());
        }
        until_done_or_interrupted(&orch, project_id, orch.start_initialization(project_id, force)).await
    })?;

    if json {
        return print_json(&report);
    }

    let session = &report.report.session;
    println!(
        "Initializer session {} ended: {}",
        session.id, session.status
    );
    match &report.report.end {
        SessionEnd::Blocked { intervention_id } => {
            println!("Project '{}' is BLOCKED by intervention {}", project_id, intervention_id);
            println!(
                "Fix the cause, then run: autopilot resume {} --by <name> --notes \"...\"",
                intervention_id
            );
        }
        _ if report.phase == ProjectPhase::Ready => {
            let progress = orch.project_status(project_id)?.progress;
            println!(
                "Roadmap ready: {} tasks, {} tests. Start coding with: autopilot run {}",
                progress.total_tasks, progress.total_tests, project_id
            );
        }
        _ => {
            println!("Project '{}' is {}", project_id, report.phase);
            if report.rows_rolled_back > 0 {
                println!("Rolled back {} partially created roadmap rows", report.rows_rolled_back);
            }
        }
    }
    Ok(())
}

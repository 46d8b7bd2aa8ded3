use anyhow::Result;
use std::path::Path;

use autopilot::orchestrator::{LoopExit, SessionEnd};

use super::{orchestrator, print_json, runtime, until_done_or_interrupted};

pub fn run(dir: &Path, project_id: &str, max_iterations: Option<u32>, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let rt = runtime()?;

    let summary = rt.block_on(async {
        if let Some(sweep) = orch.startup_sweep().await?
            && !sweep.interrupted.is_empty()
        {
            eprintln!("Swept {} orphaned session(s)", sweep.interrupted.len());
        }
        until_done_or_interrupted(
            &orch,
            project_id,
            orch.start_coding_loop(project_id, max_iterations),
        )
        .await
    })?;

    if json {
        return print_json(&summary);
    }

    for report in &summary.sessions {
        let s = &report.session;
        let detail = match &report.end {
            SessionEnd::Blocked { intervention_id } => format!(" (intervention {})", intervention_id),
            SessionEnd::Interrupted { reason } => format!(" ({})", reason),
            SessionEnd::Failed { message } => format!(" ({})", message),
            SessionEnd::Completed | SessionEnd::Stopped => String::new(),
        };
        println!(
            "Session #{} {}: {}{}, {} task(s) completed",
            s.session_number, s.id, s.status, detail, s.metrics.tasks_completed
        );
    }
    println!(
        "Loop finished ({}) after {} session(s); project is {}",
        summary.exit,
        summary.sessions.len(),
        summary.phase
    );
    if summary.exit == LoopExit::Blocked {
        println!("See 'autopilot interventions --project {}'", project_id);
    }
    Ok(())
}

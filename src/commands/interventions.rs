use anyhow::Result;
use std::path::Path;

use autopilot::model::Intervention;

use super::{format_time, orchestrator, print_json};

pub fn run(dir: &Path, project_id: Option<&str>, history: bool, limit: Option<usize>, json: bool) -> Result<()> {
    let manager = orchestrator(dir)?.interventions().clone();
    let list = if history {
        manager.list_history(project_id, limit)?
    } else {
        let mut active = manager.list_active(project_id)?;
        if let Some(limit) = limit {
            active.truncate(limit);
        }
        active
    };

    if json {
        return print_json(&list);
    }
    if list.is_empty() {
        println!(
            "{}",
            if history { "No resolved interventions" } else { "No active interventions" }
        );
        return Ok(());
    }
    for i in &list {
        print_intervention(i);
    }
    Ok(())
}

fn print_intervention(i: &Intervention) {
    println!(
        "{} [{}] project={} session={}",
        i.id, i.pause_type, i.project_id, i.session_id
    );
    println!("  reason:  {}", i.pause_reason);
    println!("  paused:  {}", format_time(&i.paused_at));
    if let Some(task) = &i.current_task_id {
        println!("  task:    {}", task);
    }
    println!("  auto-resumable: {}", if i.can_auto_resume { "yes" } else { "no" });
    if i.resolved {
        println!(
            "  resolved: {} by {}",
            i.resolved_at.as_ref().map(format_time).unwrap_or_default(),
            i.resolved_by.as_deref().unwrap_or("?")
        );
        if let Some(notes) = &i.resolution_notes {
            println!("  notes:   {}", notes);
        }
    }
}

use anyhow::Result;
use std::path::Path;

use autopilot::model::{ProjectSettings, SandboxMode};
use autopilot::orchestrator::{NewProject, ProjectStatus};

use super::{format_time, orchestrator, print_json};

pub fn add(
    dir: &Path,
    name: &str,
    id: Option<&str>,
    sandbox: SandboxMode,
    model: Option<&str>,
    max_iterations: Option<u32>,
    json: bool,
) -> Result<()> {
    let orch = orchestrator(dir)?;
    let project = orch.create_project(NewProject {
        name: name.to_string(),
        id: id.map(String::from),
        sandbox,
        settings: ProjectSettings {
            model: model.map(String::from),
            max_iterations,
        },
    })?;

    if json {
        print_json(&project)?;
    } else {
        println!("Created project '{}' ({})", project.id, project.name);
    }
    Ok(())
}

pub fn list(dir: &Path, json: bool) -> Result<()> {
    let orch = orchestrator(dir)?;
    let projects = orch.list_projects()?;
    let ledger = orch.store().snapshot()?;

    if json {
        let rows: Vec<_> = projects
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "name": p.name,
                    "phase": p.phase,
                    "progress": ledger.progress(&p.id),
                })
            })
            .collect();
        return print_json(&rows);
    }

    if projects.is_empty() {
        println!("No projects");
        return Ok(());
    }
    for p in &projects {
        let progress = ledger.progress(&p.id);
        println!(
            "{:<20} {:<14} {}/{} tasks  {}",
            p.id, p.phase, progress.completed_tasks, progress.total_tasks, p.name
        );
    }
    Ok(())
}

pub fn show(dir: &Path, id: &str, json: bool) -> Result<()> {
    let status = orchestrator(dir)?.project_status(id)?;
    if json {
        return print_json(&status);
    }
    print_status(&status);
    Ok(())
}

pub fn set(dir: &Path, id: &str, model: Option<&str>, max_iterations: Option<u32>, json: bool) -> Result<()> {
    if model.is_none() && max_iterations.is_none() {
        anyhow::bail!("Nothing to change. Pass --model and/or --max-iterations.");
    }
    let project = orchestrator(dir)?.update_settings(id, model.map(String::from), max_iterations)?;
    if json {
        print_json(&project)?;
    } else {
        println!(
            "Updated '{}': model={} max_iterations={}",
            project.id,
            project.settings.model.as_deref().unwrap_or("(default)"),
            project
                .settings
                .max_iterations
                .map(|n| n.to_string())
                .unwrap_or_else(|| "(default)".into())
        );
    }
    Ok(())
}

pub fn print_status(status: &ProjectStatus) {
    let p = &status.project;
    println!("Project:  {} ({})", p.id, p.name);
    println!("Phase:    {}", p.phase);
    println!("Sandbox:  {:?}", p.sandbox);
    if let Some(mode) = p.stop_requested {
        println!("Stop:     {} requested", mode);
    }

    let progress = &status.progress;
    println!(
        "Progress: {}/{} tasks, {}/{} tests passing ({} failing)",
        progress.completed_tasks,
        progress.total_tasks,
        progress.passing_tests,
        progress.total_tests,
        progress.failing_tests
    );
    if let Some(task) = &status.next_task {
        println!("Next:     {} {}", task.id, task.description);
    }

    match &status.active_session {
        Some(s) => println!(
            "Session:  #{} {} ({}){}",
            s.session_number,
            s.id,
            s.status,
            if status.live { ", driven here" } else { "" }
        ),
        None => {
            if let Some(s) = &status.latest_session {
                println!("Last:     #{} {} ({})", s.session_number, s.id, s.status);
            }
        }
    }

    if !status.unresolved_interventions.is_empty() {
        println!();
        println!("Paused:");
        for i in &status.unresolved_interventions {
            println!(
                "  {} [{}] {} (since {})",
                i.id,
                i.pause_type,
                i.pause_reason,
                format_time(&i.paused_at)
            );
        }
    }

    if !p.log.is_empty() {
        println!();
        println!("Recent log:");
        for entry in p.log.iter().rev().take(5).rev() {
            println!("  {} {}", format_time(&entry.timestamp), entry.message);
        }
    }
}

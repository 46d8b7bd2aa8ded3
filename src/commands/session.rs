use anyhow::Result;
use std::path::Path;

use autopilot::model::Session;

use super::{format_time, orchestrator, print_json};

pub fn show(dir: &Path, id: &str, json: bool) -> Result<()> {
    let session = orchestrator(dir)?.get_session(id)?;
    if json {
        return print_json(&session);
    }

    println!("Session:  {} (#{} {})", session.id, session.session_number, session.session_type);
    println!("Project:  {}", session.project_id);
    println!("Model:    {}", session.model);
    println!("Status:   {}", session.status);
    println!("Created:  {}", format_time(&session.created_at));
    if let Some(at) = &session.started_at {
        println!("Started:  {}", format_time(at));
    }
    if let Some(at) = &session.ended_at {
        println!("Ended:    {}", format_time(at));
    }
    if let Some(pid) = session.pid {
        println!("PID:      {}", pid);
    }
    if let Some(msg) = &session.error_message {
        println!("Error:    {}", msg);
    }
    if let Some(reason) = &session.interruption_reason {
        println!("Reason:   {}", reason);
    }

    let m = &session.metrics;
    println!(
        "Metrics:  {} tool calls ({} errors), {} in / {} out tokens, ${:.4}",
        m.tool_calls, m.tool_errors, m.input_tokens, m.output_tokens, m.cost_usd
    );
    println!(
        "Progress: {} task(s) completed, {} test(s) now passing",
        m.tasks_completed, m.tests_passing
    );
    for warning in &m.quality_warnings {
        println!("Warning:  {}", warning);
    }
    Ok(())
}

pub fn list(dir: &Path, project_id: &str, json: bool) -> Result<()> {
    let sessions = orchestrator(dir)?.list_sessions(project_id)?;
    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions for '{}'", project_id);
        return Ok(());
    }
    for s in &sessions {
        print_row(s);
    }
    Ok(())
}

fn print_row(s: &Session) {
    println!(
        "#{:<4} {:<14} {:<12} {:<12} {}  {} task(s)",
        s.session_number,
        s.id,
        s.session_type.to_string(),
        s.status.to_string(),
        format_time(&s.created_at),
        s.metrics.tasks_completed
    );
}

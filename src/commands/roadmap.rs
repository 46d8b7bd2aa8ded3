//! Roadmap callbacks run by the agent during a session.
//!
//! The session is taken from `--session` or `AUTOPILOT_SESSION_ID`; without
//! one the change is an operator edit, which is refused while a session
//! is active.

use anyhow::Result;
use std::path::Path;

use autopilot::roadmap;
use autopilot::store::StoreExt;

use super::{open_store, print_json, project_id, session_id};

pub fn epic_add(
    dir: &Path,
    project: Option<&str>,
    name: &str,
    description: Option<&str>,
    priority: u32,
    session: Option<&str>,
    json: bool,
) -> Result<()> {
    let project = project_id(project)?;
    let session = session_id(session);
    let epic = open_store(dir)?.update(|ledger| {
        roadmap::add_epic(
            ledger,
            &project,
            name,
            description.map(String::from),
            priority,
            session.as_deref(),
        )
    })?;
    if json {
        return print_json(&epic);
    }
    println!("Added epic {} '{}'", epic.id, epic.name);
    Ok(())
}

pub fn task_add(
    dir: &Path,
    epic_id: &str,
    description: &str,
    priority: u32,
    session: Option<&str>,
    json: bool,
) -> Result<()> {
    let session = session_id(session);
    let task = open_store(dir)?.update(|ledger| {
        roadmap::add_task(ledger, epic_id, description, priority, session.as_deref())
    })?;
    if json {
        return print_json(&task);
    }
    println!("Added task {} to epic {}", task.id, task.epic_id);
    Ok(())
}

pub fn test_add(dir: &Path, task_id: &str, description: &str, session: Option<&str>, json: bool) -> Result<()> {
    let session = session_id(session);
    let test = open_store(dir)?
        .update(|ledger| roadmap::add_test(ledger, task_id, description, session.as_deref()))?;
    if json {
        return print_json(&test);
    }
    println!("Added test {} to task {}", test.id, test.task_id);
    Ok(())
}

pub fn task_done(dir: &Path, task_id: &str, session: Option<&str>, json: bool) -> Result<()> {
    let session = session_id(session);
    let task = open_store(dir)?
        .update(|ledger| roadmap::complete_task(ledger, task_id, session.as_deref()))?;
    if json {
        return print_json(&task);
    }
    println!("Marked task {} done", task.id);
    Ok(())
}

pub fn test_result(dir: &Path, test_id: &str, passes: bool, session: Option<&str>, json: bool) -> Result<()> {
    let session = session_id(session);
    let test = open_store(dir)?
        .update(|ledger| roadmap::set_test_result(ledger, test_id, passes, session.as_deref()))?;
    if json {
        return print_json(&test);
    }
    println!(
        "Test {} {}",
        test.id,
        if passes { "passes" } else { "fails" }
    );
    Ok(())
}

use anyhow::Result;
use std::path::Path;

use autopilot::roadmap;
use autopilot::store::TaskStore;

use super::{open_store, print_json, project_id};

/// Print the next eligible task with its tests
pub fn run(dir: &Path, project: Option<&str>, json: bool) -> Result<()> {
    let project = project_id(project)?;
    let ledger = open_store(dir)?.snapshot()?;
    ledger.project_or_err(&project)?;

    let Some(task) = roadmap::next_task(&ledger, &project) else {
        if json {
            return print_json(&serde_json::Value::Null);
        }
        println!("No remaining tasks for '{}'", project);
        return Ok(());
    };
    let tests: Vec<_> = ledger.tests_for_task(&task.id).collect();

    if json {
        return print_json(&serde_json::json!({ "task": task, "tests": tests }));
    }
    println!("{} {}", task.id, task.description);
    if let Some(epic) = ledger.epic(&task.epic_id) {
        println!("  epic: {} {}", epic.id, epic.name);
    }
    for test in tests {
        let state = match test.passes {
            Some(true) => "pass",
            Some(false) => "FAIL",
            None => "todo",
        };
        println!("  [{}] {} {}", state, test.id, test.description);
    }
    Ok(())
}

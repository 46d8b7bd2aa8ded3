//! Roadmap mutations and queries (epics, tasks, tests).
//!
//! A running session calls back into these through the CLI. Rows record
//! the session that created them, which is what makes rolling back a
//! cancelled initializer exact. A mutation naming a session is refused
//! unless that session is active; an operator mutation (no session) is
//! refused while the project has an active session, since the roadmap
//! then belongs to that session.

use chrono::Utc;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Epic, Ledger, Record, Task, Test, new_id};

fn check_writer(ledger: &Ledger, project_id: &str, session_id: Option<&str>) -> Result<()> {
    ledger.project_or_err(project_id)?;
    match session_id {
        Some(id) => {
            let session = ledger.session_or_err(id)?;
            if session.project_id != project_id {
                return Err(Error::InvalidState(format!(
                    "session '{}' belongs to project '{}', not '{}'",
                    id, session.project_id, project_id
                )));
            }
            if !session.status.is_active() {
                return Err(Error::InvalidState(format!(
                    "session '{}' is {}; only an active session may change the roadmap",
                    id, session.status
                )));
            }
        }
        None => {
            if let Some(active) = ledger.active_session(project_id) {
                return Err(Error::AlreadyRunning {
                    project_id: project_id.to_string(),
                    session_id: active.id.clone(),
                });
            }
        }
    }
    Ok(())
}

pub fn add_epic(
    ledger: &mut Ledger,
    project_id: &str,
    name: &str,
    description: Option<String>,
    priority: u32,
    session_id: Option<&str>,
) -> Result<Epic> {
    check_writer(ledger, project_id, session_id)?;
    let epic = Epic {
        id: new_id("epic"),
        project_id: project_id.to_string(),
        name: name.to_string(),
        description,
        priority,
        created_in_session: session_id.map(String::from),
        created_at: Utc::now(),
    };
    ledger.insert(Record::Epic(epic.clone()));
    Ok(epic)
}

pub fn add_task(
    ledger: &mut Ledger,
    epic_id: &str,
    description: &str,
    priority: u32,
    session_id: Option<&str>,
) -> Result<Task> {
    let project_id = ledger
        .epic(epic_id)
        .ok_or_else(|| Error::not_found("epic", epic_id))?
        .project_id
        .clone();
    check_writer(ledger, &project_id, session_id)?;
    let task = Task {
        id: new_id("task"),
        project_id,
        epic_id: epic_id.to_string(),
        description: description.to_string(),
        priority,
        done: false,
        completed_at: None,
        created_in_session: session_id.map(String::from),
        created_at: Utc::now(),
    };
    ledger.insert(Record::Task(task.clone()));
    Ok(task)
}

pub fn add_test(
    ledger: &mut Ledger,
    task_id: &str,
    description: &str,
    session_id: Option<&str>,
) -> Result<Test> {
    let project_id = ledger
        .task(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))?
        .project_id
        .clone();
    check_writer(ledger, &project_id, session_id)?;
    let test = Test {
        id: new_id("test"),
        project_id,
        task_id: task_id.to_string(),
        description: description.to_string(),
        passes: None,
        created_in_session: session_id.map(String::from),
        created_at: Utc::now(),
    };
    ledger.insert(Record::Test(test.clone()));
    Ok(test)
}

/// Mark a task done. Counts toward the session's metrics the first time.
pub fn complete_task(ledger: &mut Ledger, task_id: &str, session_id: Option<&str>) -> Result<Task> {
    let project_id = ledger
        .task(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))?
        .project_id
        .clone();
    check_writer(ledger, &project_id, session_id)?;

    let task = ledger
        .task_mut(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))?;
    let newly_done = !task.done;
    task.done = true;
    if newly_done {
        task.completed_at = Some(Utc::now());
    }
    let task = task.clone();

    if newly_done && let Some(id) = session_id {
        ledger.session_mut_or_err(id)?.metrics.tasks_completed += 1;
    }
    Ok(task)
}

/// Record a test outcome. A flip to passing counts toward the session.
pub fn set_test_result(
    ledger: &mut Ledger,
    test_id: &str,
    passes: bool,
    session_id: Option<&str>,
) -> Result<Test> {
    let project_id = ledger
        .test(test_id)
        .ok_or_else(|| Error::not_found("test", test_id))?
        .project_id
        .clone();
    check_writer(ledger, &project_id, session_id)?;

    let test = ledger
        .test_mut(test_id)
        .ok_or_else(|| Error::not_found("test", test_id))?;
    let newly_passing = passes && test.passes != Some(true);
    test.passes = Some(passes);
    let test = test.clone();

    if newly_passing && let Some(id) = session_id {
        ledger.session_mut_or_err(id)?.metrics.tests_passing += 1;
    }
    Ok(test)
}

/// Next eligible task: not done, ordered by epic priority, then task
/// priority, then creation time. Lower priority numbers go first.
pub fn next_task<'a>(ledger: &'a Ledger, project_id: &str) -> Option<&'a Task> {
    ledger
        .tasks_for(project_id)
        .filter(|t| !t.done)
        .min_by_key(|t| {
            let epic_priority = ledger.epic(&t.epic_id).map(|e| e.priority).unwrap_or(u32::MAX);
            (epic_priority, t.priority, t.created_at)
        })
}

/// Delete every epic/task/test created by `session_id`
pub fn rollback_session(ledger: &mut Ledger, session_id: &str) -> usize {
    ledger.retain_roadmap(|_, created_in| created_in != Some(session_id))
}

/// Clear task completion and test results for a project
pub fn reset_progress(ledger: &mut Ledger, project_id: &str) {
    for task in ledger.tasks_for_mut(project_id) {
        task.done = false;
        task.completed_at = None;
    }
    for test in ledger.tests_for_mut(project_id) {
        test.passes = None;
    }
}

/// A done task that still has failing tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualitySignal {
    pub task_id: String,
    pub failing_tests: Vec<String>,
}

impl QualitySignal {
    pub fn message(&self) -> String {
        format!(
            "task {} is done but {} test(s) fail: {}",
            self.task_id,
            self.failing_tests.len(),
            self.failing_tests.join(", ")
        )
    }
}

pub fn quality_signals(ledger: &Ledger, project_id: &str) -> Vec<QualitySignal> {
    ledger
        .tasks_for(project_id)
        .filter(|t| t.done)
        .filter_map(|t| {
            let failing: Vec<String> = ledger
                .tests_for_task(&t.id)
                .filter(|x| x.passes == Some(false))
                .map(|x| x.id.clone())
                .collect();
            (!failing.is_empty()).then(|| QualitySignal {
                task_id: t.id.clone(),
                failing_tests: failing,
            })
        })
        .collect()
}

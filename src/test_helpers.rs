//! Test fixtures: a scripted [`SessionRunner`] and a config with short
//! timings. Enabled for unit tests and, through the `test-support`
//! feature, for the integration tests in `tests/`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Project, Record};
use crate::roadmap;
use crate::service::{LaunchRequest, ProcessHandle, SessionEvent, SessionRunner};
use crate::store::{StoreExt, TaskStore};

/// Runs against the store the way an agent's CLI callbacks would
pub type StoreAction = Arc<dyn Fn(&dyn TaskStore, &LaunchRequest) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum Step {
    Event(SessionEvent),
    /// Sleep, ending early (stream closed) if cancelled
    Delay(Duration),
    /// Block until cancelled
    Hang,
    /// End the stream without a terminal event
    Crash,
    Store(StoreAction),
}

/// What one scripted agent invocation does
#[derive(Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    launch_error: Option<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn event(self, event: SessionEvent) -> Self {
        self.step(Step::Event(event))
    }

    pub fn tool_use(self, tool: &str) -> Self {
        self.event(SessionEvent::ToolUse {
            tool: tool.to_string(),
            task_id: None,
        })
    }

    pub fn tool_ok(self, tool: &str) -> Self {
        self.tool_use(tool).event(SessionEvent::ToolResult {
            tool: tool.to_string(),
            is_error: false,
            content: "ok".to_string(),
        })
    }

    pub fn tool_error(self, tool: &str, message: &str) -> Self {
        self.tool_use(tool).event(SessionEvent::ToolResult {
            tool: tool.to_string(),
            is_error: true,
            content: message.to_string(),
        })
    }

    /// The same failure `n` times; `{n}` in the message is replaced by the
    /// attempt number so only volatile parts differ
    pub fn tool_errors(self, tool: &str, message: &str, n: usize) -> Self {
        (1..=n).fold(self, |script, i| {
            script.tool_error(tool, &message.replace("{n}", &i.to_string()))
        })
    }

    pub fn usage(self, input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        self.event(SessionEvent::Usage {
            input_tokens,
            output_tokens,
            cost_usd,
        })
    }

    pub fn complete(self) -> Self {
        self.event(SessionEvent::SessionComplete {
            summary: Some("done".to_string()),
        })
    }

    pub fn session_error(self, message: &str) -> Self {
        self.event(SessionEvent::SessionError {
            message: message.to_string(),
        })
    }

    pub fn delay(self, duration: Duration) -> Self {
        self.step(Step::Delay(duration))
    }

    pub fn hang(self) -> Self {
        self.step(Step::Hang)
    }

    pub fn crash(self) -> Self {
        self.step(Step::Crash)
    }

    pub fn fail_launch(mut self, message: &str) -> Self {
        self.launch_error = Some(message.to_string());
        self
    }

    pub fn store<F>(self, action: F) -> Self
    where
        F: Fn(&dyn TaskStore, &LaunchRequest) -> Result<()> + Send + Sync + 'static,
    {
        self.step(Step::Store(Arc::new(action)))
    }

    /// `epics` epics of `tasks` tasks, one test per task, all created by
    /// the running session
    pub fn build_roadmap(self, epics: usize, tasks: usize) -> Self {
        self.store(move |store, request| {
            let session = Some(request.session_id.as_str());
            store.update(|ledger| {
                for e in 0..epics {
                    let epic = roadmap::add_epic(
                        ledger,
                        &request.project_id,
                        &format!("Epic {}", e + 1),
                        None,
                        e as u32,
                        session,
                    )?;
                    for t in 0..tasks {
                        let task = roadmap::add_task(
                            ledger,
                            &epic.id,
                            &format!("Task {}.{}", e + 1, t + 1),
                            t as u32,
                            session,
                        )?;
                        roadmap::add_test(ledger, &task.id, "it works", session)?;
                    }
                }
                Ok(())
            })
        })
    }

    /// Complete the next eligible task and pass its tests
    pub fn complete_next_task(self) -> Self {
        self.store(|store, request| {
            let session = Some(request.session_id.as_str());
            store.update(|ledger| {
                let Some(task_id) = roadmap::next_task(ledger, &request.project_id).map(|t| t.id.clone())
                else {
                    return Ok(());
                };
                let tests: Vec<String> = ledger.tests_for_task(&task_id).map(|t| t.id.clone()).collect();
                for test in tests {
                    roadmap::set_test_result(ledger, &test, true, session)?;
                }
                roadmap::complete_task(ledger, &task_id, session)?;
                Ok(())
            })
        })
    }

    /// Complete every open task without touching its tests
    pub fn complete_all_tasks(self) -> Self {
        self.store(|store, request| {
            let session = Some(request.session_id.as_str());
            store.update(|ledger| {
                let open: Vec<String> = ledger
                    .tasks_for(&request.project_id)
                    .filter(|t| !t.done)
                    .map(|t| t.id.clone())
                    .collect();
                for task in open {
                    roadmap::complete_task(ledger, &task, session)?;
                }
                Ok(())
            })
        })
    }
}

/// Plays one queued [`Script`] per launch; an empty queue yields a
/// session that completes immediately
pub struct ScriptedRunner {
    store: Arc<dyn TaskStore>,
    scripts: Mutex<VecDeque<Script>>,
    launches: Mutex<Vec<LaunchRequest>>,
}

impl ScriptedRunner {
    pub fn new(store: Arc<dyn TaskStore>, scripts: Vec<Script>) -> Self {
        Self {
            store,
            scripts: Mutex::new(scripts.into()),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
    }

    /// Every request seen so far, in launch order
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SessionRunner for ScriptedRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Script::new().complete());
        if let Some(message) = script.launch_error {
            return Err(Error::Launch(message));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(play(
            script.steps,
            request,
            self.store.clone(),
            tx,
            cancel.clone(),
        ));
        Ok(ProcessHandle {
            pid: None,
            events: rx,
            cancel,
        })
    }
}

async fn play(
    steps: Vec<Step>,
    request: LaunchRequest,
    store: Arc<dyn TaskStore>,
    tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    for step in steps {
        match step {
            Step::Event(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Step::Delay(duration) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(duration) => {}
                }
            }
            Step::Hang => {
                cancel.cancelled().await;
                return;
            }
            Step::Crash => return,
            Step::Store(action) => {
                if let Err(e) = action(store.as_ref(), &request) {
                    let _ = tx
                        .send(SessionEvent::SessionError {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// Defaults with timings short enough for tests
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.stop_grace_secs = 1;
    config.orchestrator.heartbeat_secs = 1;
    config.orchestrator.stop_poll_secs = 1;
    config
}

/// Insert a bare project directly
pub fn seed_project(store: &dyn TaskStore, id: &str, name: &str) -> Project {
    let project = Project::new(id, name);
    let inserted = project.clone();
    store
        .update(move |ledger| {
            ledger.insert(Record::Project(inserted));
            Ok(())
        })
        .unwrap_or_else(|e| panic!("failed to seed project '{}': {}", id, e));
    project
}

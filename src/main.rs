use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use autopilot::config::Config;
use autopilot::logging;
use autopilot::model::SandboxMode;

mod commands;

#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Autopilot - run autonomous coding agents against a project roadmap")]
#[command(version)]
struct Cli {
    /// Path to the state directory (default: .autopilot in current dir)
    #[arg(long, global = true, env = "AUTOPILOT_DIR")]
    dir: Option<PathBuf>,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory, store and default config
    Init,

    /// Create, list, inspect and configure projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// One-screen status of every project
    Status,

    /// Run the initializer session to build a project's roadmap
    Initialize {
        project: String,

        /// Discard an existing roadmap and initialize again
        #[arg(long)]
        force: bool,
    },

    /// Run coding sessions until done, stopped, capped or blocked
    Run {
        project: String,

        /// Session cap for this run (0 = unlimited)
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Stop a project's loop after the current session, or now
    Stop {
        project: String,

        /// Cancel the running session instead of waiting for it
        #[arg(long)]
        immediate: bool,
    },

    /// Stop a running initializer and remove what it created
    CancelInit { project: String },

    /// Pause the project's session for human intervention
    Pause {
        project: String,

        #[arg(long)]
        reason: String,

        /// Who is pausing
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Resolve an intervention so the project can run again
    Resume {
        intervention: String,

        /// Who resolved it
        #[arg(long)]
        by: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List unresolved interventions (or resolved ones with --history)
    Interventions {
        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        history: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one session
    Session { id: String },

    /// List a project's sessions
    Sessions { project: String },

    /// Return an idle project to READY
    Reset {
        project: String,

        /// Also clear task completion and test results
        #[arg(long)]
        hard: bool,
    },

    /// Mark orphaned sessions interrupted
    Sweep,

    /// Roadmap epics
    Epic {
        #[command(subcommand)]
        command: EpicCommands,
    },

    /// Roadmap tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Roadmap tests
    Test {
        #[command(subcommand)]
        command: TestCommands,
    },

    /// Show the next eligible task
    Next {
        #[arg(long)]
        project: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project
    Add {
        name: String,

        /// Project ID (derived from the name if not provided)
        #[arg(long)]
        id: Option<String>,

        /// docker or local
        #[arg(long, default_value = "local")]
        sandbox: SandboxMode,

        /// Model for this project's sessions
        #[arg(long)]
        model: Option<String>,

        /// Default session cap per run (0 = unlimited)
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// List projects
    List,

    /// Show a project's status
    Show { id: String },

    /// Change a project's settings
    Set {
        id: String,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,
    },
}

#[derive(Subcommand)]
enum EpicCommands {
    /// Add an epic
    Add {
        name: String,

        /// Project (default: $AUTOPILOT_PROJECT_ID)
        #[arg(long)]
        project: Option<String>,

        #[arg(long, short = 'd')]
        description: Option<String>,

        /// Lower runs first
        #[arg(long, default_value_t = 0)]
        priority: u32,

        /// Session making the change (default: $AUTOPILOT_SESSION_ID)
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task to an epic
    Add {
        epic: String,

        description: String,

        #[arg(long, default_value_t = 0)]
        priority: u32,

        #[arg(long)]
        session: Option<String>,
    },

    /// Mark a task done
    Done {
        id: String,

        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum TestCommands {
    /// Add a test to a task
    Add {
        task: String,

        description: String,

        #[arg(long)]
        session: Option<String>,
    },

    /// Record a test outcome
    Result {
        id: String,

        outcome: Outcome,

        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Pass,
    Fail,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let dir = cli.dir.clone().unwrap_or_else(|| PathBuf::from(".autopilot"));

    let log_config = Config::load(&dir).map(|c| c.log).unwrap_or_default();
    logging::init(&log_config, cli.verbose);

    match run(cli, dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<autopilot::Error>()
                .map(autopilot::Error::exit_code)
                .unwrap_or(ExitCode::FAILURE)
        }
    }
}

fn run(cli: Cli, dir: PathBuf) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Init => commands::init::run(&dir),
        Commands::Project { command } => match command {
            ProjectCommands::Add {
                name,
                id,
                sandbox,
                model,
                max_iterations,
            } => commands::project::add(
                &dir,
                &name,
                id.as_deref(),
                sandbox,
                model.as_deref(),
                max_iterations,
                json,
            ),
            ProjectCommands::List => commands::project::list(&dir, json),
            ProjectCommands::Show { id } => commands::project::show(&dir, &id, json),
            ProjectCommands::Set {
                id,
                model,
                max_iterations,
            } => commands::project::set(&dir, &id, model.as_deref(), max_iterations, json),
        },
        Commands::Status => commands::status::run(&dir, json),
        Commands::Initialize { project, force } => {
            commands::initialize::run(&dir, &project, force, json)
        }
        Commands::Run {
            project,
            max_iterations,
        } => commands::run::run(&dir, &project, max_iterations, json),
        Commands::Stop { project, immediate } => commands::stop::run(&dir, &project, immediate, json),
        Commands::CancelInit { project } => commands::cancel_init::run(&dir, &project, json),
        Commands::Pause { project, reason, by } => {
            commands::pause::run(&dir, &project, &reason, &by, json)
        }
        Commands::Resume {
            intervention,
            by,
            notes,
        } => commands::resume::run(&dir, &intervention, &by, notes.as_deref(), json),
        Commands::Interventions {
            project,
            history,
            limit,
        } => commands::interventions::run(&dir, project.as_deref(), history, limit, json),
        Commands::Session { id } => commands::session::show(&dir, &id, json),
        Commands::Sessions { project } => commands::session::list(&dir, &project, json),
        Commands::Reset { project, hard } => commands::reset::run(&dir, &project, hard, json),
        Commands::Sweep => commands::sweep::run(&dir, json),
        Commands::Epic { command } => match command {
            EpicCommands::Add {
                name,
                project,
                description,
                priority,
                session,
            } => commands::roadmap::epic_add(
                &dir,
                project.as_deref(),
                &name,
                description.as_deref(),
                priority,
                session.as_deref(),
                json,
            ),
        },
        Commands::Task { command } => match command {
            TaskCommands::Add {
                epic,
                description,
                priority,
                session,
            } => commands::roadmap::task_add(&dir, &epic, &description, priority, session.as_deref(), json),
            TaskCommands::Done { id, session } => {
                commands::roadmap::task_done(&dir, &id, session.as_deref(), json)
            }
        },
        Commands::Test { command } => match command {
            TestCommands::Add {
                task,
                description,
                session,
            } => commands::roadmap::test_add(&dir, &task, &description, session.as_deref(), json),
            TestCommands::Result {
                id,
                outcome,
                session,
            } => {
                let passes = matches!(outcome, Outcome::Pass);
                commands::roadmap::test_result(&dir, &id, passes, session.as_deref(), json)
            }
        },
        Commands::Next { project } => commands::next::run(&dir, project.as_deref(), json),
    }
}

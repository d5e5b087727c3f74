//! `duet` command line.
//!
//! `duet init` scaffolds `.orchestrator/` in the current directory; `duet run`
//! drives the plan/implement phases against the task file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use duet::controller::ThreadSleeper;
use duet::core::types::Phase;
use duet::exit_codes;
use duet::io::agents::AgentRegistry;
use duet::io::config::{OrchestratorConfig, load_config};
use duet::io::executor::{DryRunExecutor, Executor, ProcessExecutor};
use duet::io::paths::{DEFAULT_TASK_FILE, InitOptions, OrchestratorPaths, init_orchestrator};
use duet::io::preflight::{self, PreflightOptions};
use duet::io::test_runner::{DryRunTestRunner, ShellTestRunner, TestRunner};
use duet::logging;
use duet::pipeline::{Collaborators, PipelineOptions, run_pipeline};

#[derive(Parser)]
#[command(
    name = "duet",
    version,
    about = "Two-agent plan/implement orchestrator with approval gates"
)]
struct Cli {
    /// Log debug events.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default `config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run (or resume) both phases for the task file.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Task description file.
    #[arg(long, default_value = DEFAULT_TASK_FILE)]
    task_file: PathBuf,
    /// Continue the persisted run.
    #[arg(long, conflicts_with = "force")]
    resume: bool,
    /// Start a new run even if a run state exists.
    #[arg(long)]
    force: bool,
    /// Restart from the given phase.
    #[arg(long, value_enum)]
    from_phase: Option<StartPhase>,
    /// Skip checkpoint rollback when resuming.
    #[arg(long)]
    no_recover: bool,
    /// Simulate agents and tests.
    #[arg(long)]
    dry_run: bool,
    /// Shell command run after each implementation step.
    #[arg(long)]
    test_command: Option<String>,
    #[arg(long)]
    max_agent_retries: Option<u32>,
    #[arg(long)]
    phase1_max_cycles: Option<u32>,
    #[arg(long)]
    phase2_max_cycles: Option<u32>,
    /// Show agent output lines while they run.
    #[arg(long)]
    live_stream: bool,
    /// Route quota-blocked agents to their configured fallback.
    #[arg(long)]
    allow_fallback: bool,
    /// Fail preflight on unresolvable provider hosts.
    #[arg(long, conflicts_with = "skip_preflight")]
    strict_preflight: bool,
    #[arg(long)]
    skip_preflight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StartPhase {
    Phase1,
    Phase2,
}

impl From<StartPhase> for Phase {
    fn from(value: StartPhase) -> Self {
        match value {
            StartPhase::Phase1 => Phase::Phase1,
            StartPhase::Phase2 => Phase::Phase2,
        }
    }
}

impl RunArgs {
    /// CLI flags win over `config.toml`.
    fn apply(&self, config: &mut OrchestratorConfig) {
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(command) = &self.test_command {
            config.test_command = command.clone();
        }
        if let Some(retries) = self.max_agent_retries {
            config.max_agent_retries = retries;
        }
        if let Some(cycles) = self.phase1_max_cycles {
            config.phase1_max_cycles = cycles;
        }
        if let Some(cycles) = self.phase2_max_cycles {
            config.phase2_max_cycles = cycles;
        }
        if self.live_stream {
            config.live_stream.enabled = true;
        }
        if self.allow_fallback {
            config.fallback.enabled = true;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_level());
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => {
            let paths = init_orchestrator(&root, &InitOptions { force })?;
            info!(config = %paths.config_path.display(), "initialized");
            Ok(exit_codes::OK)
        }
        Command::Run(args) => cmd_run(root, &args),
    }
}

fn cmd_run(root: PathBuf, args: &RunArgs) -> Result<i32> {
    let paths = OrchestratorPaths::new(&root);
    let mut config = load_config(&paths.config_path)?;
    args.apply(&mut config);
    config.validate()?;

    let registry = AgentRegistry::builtin(&config.agents);
    let mut agents = config.roles.agents();
    for agent in config.roles.agents() {
        if let Some(fallback) = config.fallback.target(agent)
            && !agents.contains(&fallback)
        {
            agents.push(fallback);
        }
    }
    for agent in &agents {
        registry.require(agent)?;
    }

    if config.dry_run {
        info!("dry run: agent calls and the test command are simulated");
    } else if args.skip_preflight {
        info!("preflight skipped");
    } else {
        preflight::run(
            &registry,
            &agents,
            PreflightOptions {
                strict: args.strict_preflight,
            },
        )?;
    }

    let executor: Box<dyn Executor + '_> = if config.dry_run {
        Box::new(DryRunExecutor)
    } else {
        Box::new(
            ProcessExecutor::new(
                &registry,
                config.live_stream.clone(),
                config.agent_output_limit_bytes,
            )
            .with_workdir(root.clone()),
        )
    };
    let tests: Box<dyn TestRunner> = if config.dry_run {
        Box::new(DryRunTestRunner)
    } else {
        Box::new(ShellTestRunner)
    };

    let options = PipelineOptions {
        root,
        task_file: args.task_file.clone(),
        resume: args.resume,
        force: args.force,
        from_phase: args.from_phase.map(Phase::from),
        recover: !args.no_recover,
    };
    let outcome = run_pipeline(
        &options,
        &config,
        Collaborators {
            executor: executor.as_ref(),
            tests: tests.as_ref(),
            sleeper: &ThreadSleeper,
        },
    )?;
    Ok(outcome.exit_code())
}

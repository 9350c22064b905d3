//! ClawMate CLI - Main entry point

mod cli;
mod plan;
mod prompt;

use claw_agent::AgentMode;
use claw_foundation::{ApprovalMode, JsonStore, PipelineConfig, RiskTier, SandboxMode};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ClawMate - approve, sandbox and run agent commands
#[derive(Parser, Debug)]
#[command(name = "clawmate")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Approval mode (auto, prompt, defer)
    #[arg(long, global = true)]
    approval: Option<String>,

    /// Sandbox mode (off, on, forced)
    #[arg(long, global = true)]
    sandbox: Option<String>,

    /// Never start containers
    #[arg(long, global = true)]
    no_containers: bool,

    /// Approve every prompt and batch without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

/// One command invocation shared by `exec`, `stream` and `classify`
#[derive(ClapArgs, Debug, Clone)]
pub struct RequestArgs {
    /// Program to run
    pub command: String,

    /// Arguments, passed through without shell interpretation
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Working directory
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Declared risk tier (safe, sensitive, destructive)
    #[arg(long)]
    pub tier: Option<String>,

    /// Force container placement
    #[arg(long, conflicts_with = "host")]
    pub container: bool,

    /// Force host placement
    #[arg(long)]
    pub host: bool,

    /// Timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one command through approval and the sandbox selector
    Exec(RequestArgs),
    /// Run one command as a live session; stdin lines are forwarded to it
    Stream(RequestArgs),
    /// Show the risk tier and placement a command would get
    Classify(RequestArgs),
    /// Run an agent session from a plan file
    Run {
        /// Plan file (JSON)
        plan: PathBuf,

        /// Agent mode (assist, guided, autonomous, swarm)
        #[arg(short, long)]
        mode: Option<String>,

        /// Concurrent actions in swarm mode
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maximum number of actions
        #[arg(long)]
        max_steps: Option<usize>,

        /// Session timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skills directory (defaults to <config>/clawmate/skills)
        #[arg(long)]
        skills: Option<PathBuf>,
    },
    /// Show host, container and tool status
    Info {
        /// Check whether these programs are on PATH
        #[arg(long)]
        check: Vec<String>,

        /// Skills directory (defaults to <config>/clawmate/skills)
        #[arg(long)]
        skills: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(&args)?;
    let options = cli::Options {
        json: args.json,
        assume_yes: args.yes,
    };

    let code = match args.command {
        Command::Exec(request) => cli::exec(config, &request, &options).await?,
        Command::Stream(request) => cli::stream(config, &request, &options).await?,
        Command::Classify(request) => cli::classify(config, &request, &options)?,
        Command::Run {
            plan,
            mode,
            concurrency,
            max_steps,
            timeout,
            skills,
        } => {
            let mode = mode
                .map(|m| m.parse::<AgentMode>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let run = cli::RunOptions {
                plan,
                mode,
                concurrency,
                max_steps,
                timeout,
                skills: skills_dir(skills),
            };
            cli::run(config, run, &options).await?
        }
        Command::Info { check, skills } => {
            cli::info(config, &check, skills_dir(skills), &options).await?
        }
    };

    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

/// Config files and environment, then command-line overrides
fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load()?;
    if let Some(mode) = &args.approval {
        config.approval.mode = ApprovalMode::parse(mode)
            .ok_or_else(|| anyhow::anyhow!("unknown approval mode: {}", mode))?;
    }
    if let Some(mode) = &args.sandbox {
        config.sandbox.mode = SandboxMode::parse(mode)
            .ok_or_else(|| anyhow::anyhow!("unknown sandbox mode: {}", mode))?;
    }
    if args.no_containers {
        config.container.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

fn skills_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        JsonStore::global()
            .ok()
            .map(|store| store.base_dir().join("skills"))
    })
}

impl RequestArgs {
    pub fn tier(&self) -> anyhow::Result<Option<RiskTier>> {
        self.tier
            .as_deref()
            .map(|t| RiskTier::parse(t).ok_or_else(|| anyhow::anyhow!("unknown risk tier: {}", t)))
            .transpose()
    }
}

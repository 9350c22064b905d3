//! Subcommand implementations

use crate::plan::Plan;
use crate::prompt::{self, Console};
use crate::RequestArgs;
use claw_agent::{AgentMode, HealthState, Orchestrator, SessionStatus, ToolRegistry};
use claw_foundation::PipelineConfig;
use claw_task::{
    ActionRecord, ActionRequest, ActionResult, ApprovalGate, Classification, ExecMode,
    ExecutionTarget, Pipeline, RunContext, SandboxOverride, SandboxSelector, ShellAdapter,
};
use futures::StreamExt;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Origin stamped on requests typed at the terminal
const CLI_ORIGIN: &str = "cli";

/// Output options shared by all subcommands
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub json: bool,
    pub assume_yes: bool,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub plan: PathBuf,
    pub mode: Option<AgentMode>,
    pub concurrency: Option<usize>,
    pub max_steps: Option<usize>,
    pub timeout: Option<u64>,
    pub skills: Option<PathBuf>,
}

/// Serializable view of a processed request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordView<'a> {
    request: &'a ActionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<&'a Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<&'a claw_task::ApprovalDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<ExecutionTarget>,
    result: &'a ActionResult,
}

impl<'a> From<&'a ActionRecord> for RecordView<'a> {
    fn from(record: &'a ActionRecord) -> Self {
        Self {
            request: &record.request,
            classification: record.classification.as_ref(),
            decision: record.decision.as_ref(),
            target: record.plan.as_ref().map(|p| p.execution_target()),
            result: &record.result,
        }
    }
}

fn build_request(args: &RequestArgs, mode: ExecMode) -> anyhow::Result<ActionRequest> {
    let mut request = ActionRequest::new(&args.command)
        .with_args(args.args.iter())
        .with_mode(mode)
        .with_origin(CLI_ORIGIN);
    if let Some(cwd) = &args.cwd {
        request = request.with_cwd(cwd);
    }
    if let Some(tier) = args.tier()? {
        request = request.with_tier(tier);
    }
    if args.container {
        request = request.with_sandbox(SandboxOverride::Container);
    } else if args.host {
        request = request.with_sandbox(SandboxOverride::Host);
    }
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    request.validate()?;
    Ok(request)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted");
            token.cancel();
        }
    });
    cancel
}

fn exit_code(result: &ActionResult) -> i32 {
    match result.exit_code {
        Some(code) => code,
        None if result.is_success() => 0,
        None => 1,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// exec
// ============================================================================

pub async fn exec(config: PipelineConfig, args: &RequestArgs, options: &Options) -> anyhow::Result<i32> {
    let request = build_request(args, ExecMode::Direct)?;
    let pipeline = Pipeline::new(config)?;
    let prompter = prompt::spawn(
        pipeline.gate().clone(),
        Console::new(),
        options.assume_yes,
        true,
    );

    let ctx = RunContext::new(cancel_on_ctrl_c());
    let record = pipeline.execute(&request, &ctx).await;
    prompter.abort();

    if options.json {
        print_json(&RecordView::from(&record))?;
    } else {
        print!("{}", record.result.stdout);
        eprint!("{}", record.result.stderr);
        let _ = std::io::stdout().flush();
        print_summary(&record);
    }
    Ok(exit_code(&record.result))
}

fn print_summary(record: &ActionRecord) {
    let result = &record.result;
    match &result.failure {
        Some(failure) => eprintln!(
            "[{}] {} ({}): {}",
            result.status, record.request.command_line(), failure.kind, failure.cause
        ),
        None => eprintln!(
            "[{}] {} exit {} on {} in {}ms{}",
            result.status,
            record.request.command_line(),
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            result.location,
            result.duration_ms,
            if result.stdout_truncated || result.stderr_truncated {
                " (output truncated)"
            } else {
                ""
            }
        ),
    }
}

// ============================================================================
// stream
// ============================================================================

pub async fn stream(config: PipelineConfig, args: &RequestArgs, options: &Options) -> anyhow::Result<i32> {
    let request = build_request(args, ExecMode::Streamed)?;
    let pipeline = Pipeline::new(config)?;
    let console = Console::new();
    let prompter = prompt::spawn(
        pipeline.gate().clone(),
        console.clone(),
        options.assume_yes,
        true,
    );

    let cancel = cancel_on_ctrl_c();
    let ctx = RunContext::new(cancel.clone());
    let opened = pipeline.open_stream(&request, &ctx).await;
    prompter.abort();
    let session = match opened {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(1);
        }
    };

    let input = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(line) = console.read_line().await {
                if session.write(format!("{}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut output = session.subscribe()?;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(chunk) => {
                    stdout.write_all(&chunk.data)?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    drop(output);
    input.abort();

    if !cancel.is_cancelled() {
        let _ = tokio::time::timeout(pipeline.config().execution.kill_grace(), session.wait()).await;
    }
    let result = pipeline.close_session(session.id()).await?;

    if options.json {
        print_json(&result)?;
    } else {
        eprintln!(
            "[{}] exit {} on {} in {}ms",
            result.status,
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            result.location,
            result.duration_ms
        );
    }
    Ok(exit_code(&result))
}

// ============================================================================
// classify
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Preview {
    classification: Classification,
    target: ExecutionTarget,
    reason: String,
}

pub fn classify(config: PipelineConfig, args: &RequestArgs, options: &Options) -> anyhow::Result<i32> {
    let request = build_request(args, ExecMode::Direct)?;
    let gate = ApprovalGate::new(&config.approval)?;
    let selector = SandboxSelector::new(&config.sandbox);

    let classification = gate.classify(&request);
    let plan = selector.plan(&request, &classification, false);
    let preview = Preview {
        target: plan.execution_target(),
        reason: plan.reason.clone(),
        classification,
    };

    if options.json {
        print_json(&preview)?;
    } else {
        println!("command:   {}", request.command_line());
        println!(
            "tier:      {}{}",
            preview.classification.tier,
            if preview.classification.ambiguous { " (ambiguous)" } else { "" }
        );
        for reason in &preview.classification.reasons {
            println!("           - {}", reason);
        }
        println!("placement: {:?} ({})", preview.target, preview.reason);
    }
    Ok(0)
}

// ============================================================================
// run
// ============================================================================

fn load_tools(dir: Option<&Path>) -> anyhow::Result<ToolRegistry> {
    Ok(match dir {
        Some(dir) => ToolRegistry::load_skills(dir)?,
        None => ToolRegistry::new(),
    })
}

async fn health_of(pipeline: &Pipeline, tools: &ToolRegistry) -> HealthState {
    let health = HealthState::new().with_skills(!tools.skills().is_empty(), tools.len());
    if pipeline.config().container.ping_on_start {
        health.probe_containers(pipeline).await
    } else {
        health.observe(pipeline)
    }
}

pub async fn run(config: PipelineConfig, run: RunOptions, options: &Options) -> anyhow::Result<i32> {
    let plan = Plan::load(&run.plan)?;
    let pipeline = Arc::new(Pipeline::new(config)?);
    let tools = load_tools(run.skills.as_deref())?;
    let health = health_of(&pipeline, &tools).await;
    let orchestrator = Arc::new(Orchestrator::new(pipeline.clone(), tools, health));

    let mode = run.mode.or(plan.mode).unwrap_or_default();
    let mut session = orchestrator.session(mode);
    if let Some(limit) = run.concurrency.or(plan.concurrency) {
        session = session.with_concurrency_limit(limit);
    }
    if let Some(max_steps) = run.max_steps {
        session = session.with_max_steps(max_steps);
    }
    if let Some(secs) = run.timeout {
        session = session.with_timeout(Duration::from_secs(secs));
    }
    eprintln!("Starting session {} ({} mode)", session.id(), mode);

    let prompter = prompt::spawn(
        pipeline.gate().clone(),
        Console::new(),
        options.assume_yes,
        false,
    );
    let cancel = cancel_on_ctrl_c();
    let watcher = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            orchestrator.shutdown();
        })
    };

    let mut source = plan.into_source();
    let finished = orchestrator.run(session, &mut source).await;
    watcher.abort();
    prompter.abort();

    if options.json {
        let records: Vec<RecordView<'_>> = finished.history().iter().map(RecordView::from).collect();
        print_json(&serde_json::json!({
            "session": finished.id(),
            "mode": finished.mode(),
            "status": finished.status(),
            "reason": finished.halt().map(|h| h.reason.as_str()),
            "records": records,
            "summary": orchestrator.status(),
        }))?;
    } else {
        for record in finished.history() {
            if !record.result.stdout.is_empty() {
                print!("{}", record.result.stdout);
            }
            print_summary(record);
        }
        let _ = std::io::stdout().flush();
        eprintln!(
            "session {}: {} ({}), {} succeeded, {} failed",
            finished.id(),
            finished.status(),
            finished.halt().map(|h| h.reason.as_str()).unwrap_or(""),
            finished.succeeded(),
            finished.failed()
        );
    }

    Ok(if finished.status() == SessionStatus::Completed { 0 } else { 1 })
}

// ============================================================================
// info
// ============================================================================

pub async fn info(
    config: PipelineConfig,
    check: &[String],
    skills: Option<PathBuf>,
    options: &Options,
) -> anyhow::Result<i32> {
    let pipeline = Pipeline::new(config)?;
    let tools = load_tools(skills.as_deref())?;
    let health = health_of(&pipeline, &tools).await;
    let shell = pipeline.host().describe();
    let commands: Vec<(&str, bool)> = check
        .iter()
        .map(|program| (program.as_str(), ShellAdapter::is_command_available(program)))
        .collect();

    if options.json {
        print_json(&serde_json::json!({
            "shell": shell,
            "health": health,
            "approval": pipeline.config().approval.mode,
            "sandbox": pipeline.selector().mode(),
            "tools": tools.names(),
            "commands": commands
                .iter()
                .map(|(program, found)| (program.to_string(), *found))
                .collect::<std::collections::BTreeMap<_, _>>(),
        }))?;
        return Ok(0);
    }

    println!("host:       {} {} ({})", shell.os, shell.arch, shell.family);
    println!(
        "shell:      {:?} at {}{}",
        shell.shell,
        shell
            .shell_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not found)".to_string()),
        if shell.pty { ", pty" } else { "" }
    );
    println!("approval:   {:?}", pipeline.config().approval.mode);
    println!("sandbox:    {:?}", pipeline.selector().mode());
    println!("containers: {:?}", health.container);
    println!(
        "skills:     {} ({} tools)",
        if health.skills_loaded { "loaded" } else { "none" },
        health.tool_count
    );
    for skill in tools.skills() {
        println!("  {} {}: {}", skill.name, skill.version, skill.tools.join(", "));
    }
    for (program, found) in &commands {
        println!("{:<11} {}", format!("{}:", program), if *found { "found" } else { "missing" });
    }
    Ok(0)
}

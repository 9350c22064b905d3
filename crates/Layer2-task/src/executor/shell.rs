//! Shell Adapter - runs a single command on the host
//!
//! Features:
//! - Platform shell selection (sh/bash/zsh on Unix, PowerShell/cmd on Windows)
//! - Arguments passed as discrete argv entries, never spliced into the script
//! - Wall-clock timeout with SIGTERM -> SIGKILL escalation on the process group
//! - Bounded stdout/stderr capture with a truncation marker
//! - Inherited environment scrubbed through `EnvPolicy`

use crate::action::{ActionFailure, ActionId, ActionRequest, ActionResult, ExecMode, ExecStatus, Location};
use crate::executor::Executor;
use crate::sandbox::SandboxPlan;
use crate::stream::{self, SessionOptions, StreamSession};
use async_trait::async_trait;
use claw_foundation::{EnvPolicy, Error, ExecutionSettings, Result, StreamSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Appended to output that hit the capture limit
pub const TRUNCATION_MARKER: &str = "\n[... output truncated ...]\n";

// ============================================================================
// Shell kinds
// ============================================================================

/// Supported command interpreters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Sh,
    Bash,
    Zsh,
    #[serde(alias = "pwsh")]
    PowerShell,
    Cmd,
}

impl ShellKind {
    /// Default shell for the current OS
    pub fn default_for_os() -> Self {
        #[cfg(windows)]
        {
            Self::PowerShell
        }
        #[cfg(not(windows))]
        {
            Self::Sh
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sh" => Some(Self::Sh),
            "bash" => Some(Self::Bash),
            "zsh" => Some(Self::Zsh),
            "powershell" | "pwsh" => Some(Self::PowerShell),
            "cmd" | "cmd.exe" => Some(Self::Cmd),
            _ => None,
        }
    }

    /// Interpreter executable
    pub fn program(&self) -> &'static str {
        match self {
            ShellKind::Sh => "sh",
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::PowerShell => {
                #[cfg(windows)]
                {
                    "powershell.exe"
                }
                #[cfg(not(windows))]
                {
                    "pwsh"
                }
            }
            ShellKind::Cmd => "cmd.exe",
        }
    }

    pub fn is_posix(&self) -> bool {
        matches!(self, ShellKind::Sh | ShellKind::Bash | ShellKind::Zsh)
    }

    /// Full argv (interpreter first) for `command` with discrete `args`.
    ///
    /// POSIX shells receive the arguments as positional parameters
    /// (`sh -c '<command> "$@"' sh a b`), so they are never re-parsed.
    /// Windows shells have no positional parameters; each argument is quoted
    /// with the interpreter's literal quoting rules instead.
    pub fn argv(&self, command: &str, args: &[String]) -> Vec<String> {
        let program = self.program().to_string();
        match self {
            ShellKind::Sh | ShellKind::Bash | ShellKind::Zsh => posix_argv(&program, command, args),
            ShellKind::PowerShell => {
                let script = std::iter::once(command.to_string())
                    .chain(args.iter().map(|a| powershell_quote(a)))
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![
                    program,
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    script,
                ]
            }
            ShellKind::Cmd => {
                let script = std::iter::once(command.to_string())
                    .chain(args.iter().map(|a| cmd_quote(a)))
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![program, "/C".into(), script]
            }
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// `sh -c` argv with `args` as positional parameters
pub fn posix_argv(shell: &str, command: &str, args: &[String]) -> Vec<String> {
    if args.is_empty() {
        return vec![shell.to_string(), "-c".into(), command.to_string()];
    }
    let mut argv = vec![
        shell.to_string(),
        "-c".into(),
        format!("{} \"$@\"", command),
        shell.to_string(),
    ];
    argv.extend(args.iter().cloned());
    argv
}

/// PowerShell single-quoted literal: no expansion, `'` doubled
pub fn powershell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "''"))
}

/// cmd.exe quoting: caret-escape metacharacters, double-quote anything with
/// whitespace (inner quotes doubled)
pub fn cmd_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if arg.chars().any(char::is_whitespace) {
        return format!("\"{}\"", arg.replace('"', "\"\""));
    }
    let mut out = String::with_capacity(arg.len() * 2);
    for c in arg.chars() {
        if matches!(c, '^' | '&' | '|' | '<' | '>' | '(' | ')' | '%' | '!' | '"') {
            out.push('^');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Bounded capture
// ============================================================================

/// Output buffer that stops growing at `limit` bytes
#[derive(Debug)]
pub struct BoundedCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8192)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if data.len() > room {
            self.buf.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Text plus truncation flag
    pub fn finish(&self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

/// Drain a reader into a shared capture. Keeps reading past the limit so the
/// writer never blocks on a full pipe.
pub(crate) async fn drain_into<R>(mut reader: R, capture: Arc<Mutex<BoundedCapture>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.lock().push(&buf[..n]),
        }
    }
}

// ============================================================================
// Process tree signals
// ============================================================================

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) only sends a signal; a negative pid addresses the
    // process group created for the child with process_group(0).
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Ask a process and its children to stop
pub(crate) async fn terminate_tree(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM).map_err(Error::Io)
    }
    #[cfg(windows)]
    {
        taskkill(pid, false).await
    }
}

/// Kill a process and its children
pub(crate) async fn kill_tree(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGKILL).map_err(Error::Io)
    }
    #[cfg(windows)]
    {
        taskkill(pid, true).await
    }
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/T");
    if force {
        cmd.arg("/F");
    }
    cmd.arg("/PID")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.status().await.map_err(Error::Io)?;
    Ok(())
}

// ============================================================================
// Shell Adapter
// ============================================================================

/// Captured outcome of one host command
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn into_result(self, request_id: ActionId) -> ActionResult {
        let failure = match self.status {
            ExecStatus::TimedOut => Some(ActionFailure::from(&Error::ExecutionTimeout(format!(
                "command exceeded its time limit after {:.1}s",
                self.duration.as_secs_f64()
            )))),
            ExecStatus::Killed => Some(ActionFailure::from(&Error::Cancelled)),
            _ => None,
        };
        ActionResult {
            request_id,
            exit_code: self.exit_code,
            status: self.status,
            mode: ExecMode::Direct,
            stdout: self.stdout,
            stderr: self.stderr,
            stdout_truncated: self.stdout_truncated,
            stderr_truncated: self.stderr_truncated,
            duration_ms: self.duration.as_millis() as u64,
            location: Location::Host,
            failure,
        }
    }
}

/// Host shell information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub shell: ShellKind,
    pub shell_path: Option<PathBuf>,
    pub pty: bool,
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs commands directly on the host
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    shell: ShellKind,
    env_policy: EnvPolicy,
    default_timeout: Duration,
    kill_grace: Duration,
    max_output: usize,
    stream: StreamSettings,
}

impl ShellAdapter {
    pub fn new(execution: &ExecutionSettings, stream: &StreamSettings) -> Self {
        let shell = execution
            .shell
            .as_deref()
            .and_then(|s| {
                let parsed = ShellKind::parse(s);
                if parsed.is_none() {
                    warn!("Unknown shell '{}', using the platform default", s);
                }
                parsed
            })
            .unwrap_or_else(ShellKind::default_for_os);

        Self {
            shell,
            env_policy: execution.env.clone(),
            default_timeout: execution.default_timeout(),
            kill_grace: execution.kill_grace(),
            max_output: execution.max_output_bytes,
            stream: stream.clone(),
        }
    }

    pub fn shell(&self) -> ShellKind {
        self.shell
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Resolve a program on PATH
    pub fn resolve(program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    /// Check whether a program is available on this host
    pub fn is_command_available(program: &str) -> bool {
        Self::resolve(program).is_some()
    }

    /// Describe the host platform and selected shell
    pub fn describe(&self) -> ShellInfo {
        ShellInfo {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            shell: self.shell,
            shell_path: Self::resolve(self.shell.program()),
            pty: self.stream.use_pty,
        }
    }

    /// Environment a spawned process receives
    pub fn build_env(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        self.env_policy.build(overrides)
    }

    /// Execute one command and capture its output
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ShellOutput> {
        self.execute_cancellable(command, args, cwd, env, timeout, &CancellationToken::new())
            .await
    }

    /// [`execute`](Self::execute) that also stops when `cancel` fires
    pub async fn execute_cancellable(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput> {
        let argv = self.shell.argv(command, args);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(self.build_env(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Executing with {}: {}", self.shell, command);
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn '{}': {}", argv[0], e),
            ))
        })?;
        let pid = child.id();

        let stdout = Arc::new(Mutex::new(BoundedCapture::new(self.max_output)));
        let stderr = Arc::new(Mutex::new(BoundedCapture::new(self.max_output)));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(drain_into(out, stdout.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(drain_into(err, stderr.clone())));
        }

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status?),
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let (exit_code, status) = match outcome {
            WaitOutcome::Exited(exit) => match exit.code() {
                Some(code) => (Some(code), ExecStatus::Completed),
                None => (None, ExecStatus::Killed),
            },
            stopped => {
                let status = if matches!(stopped, WaitOutcome::TimedOut) {
                    warn!("Command timed out after {:.1}s: {}", timeout.as_secs_f64(), command);
                    ExecStatus::TimedOut
                } else {
                    info!("Command cancelled: {}", command);
                    ExecStatus::Killed
                };
                if let Some(pid) = pid {
                    if let Err(e) = terminate_tree(pid).await {
                        debug!("terminate failed for {}: {}", pid, e);
                    }
                }
                if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
                    warn!("Process ignored termination, killing");
                    if let Some(pid) = pid {
                        let _ = kill_tree(pid).await;
                    }
                    let _ = child.kill().await;
                }
                (None, status)
            }
        };

        // Descendants that escaped the group may hold the pipes open
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(self.kill_grace, reader).await.is_err() {
                abort.abort();
            }
        }

        let (stdout, stdout_truncated) = stdout.lock().finish();
        let (stderr, stderr_truncated) = stderr.lock().finish();
        Ok(ShellOutput {
            exit_code,
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration: started.elapsed(),
        })
    }

    /// Open a stream session on the host (PTY or pipes per configuration)
    pub async fn open_session(&self, request: &ActionRequest) -> Result<StreamSession> {
        let argv = self.shell.argv(request.command(), request.args());
        let env = self.build_env(request.env());
        let parts = if self.stream.use_pty {
            stream::pty::spawn(
                request.id(),
                &argv,
                request.cwd(),
                &env,
                self.stream.pty_rows,
                self.stream.pty_cols,
                self.stream.chunk_size,
            )?
        } else {
            stream::pipe::spawn(
                request.id(),
                &argv,
                request.cwd(),
                &env,
                self.stream.chunk_size,
            )?
        };
        let options = SessionOptions::from_settings(&self.stream, self.kill_grace)
            .with_timeout(Some(request.timeout().unwrap_or(self.default_timeout)));
        Ok(StreamSession::start(parts, options))
    }
}

#[async_trait]
impl Executor for ShellAdapter {
    async fn run(
        &self,
        request: &ActionRequest,
        _plan: &SandboxPlan,
        cancel: &CancellationToken,
    ) -> Result<ActionResult> {
        let timeout = request.timeout().unwrap_or(self.default_timeout);
        let output = self
            .execute_cancellable(
                request.command(),
                request.args(),
                request.cwd(),
                request.env(),
                timeout,
                cancel,
            )
            .await?;
        Ok(output.into_result(request.id()))
    }

    async fn open(&self, request: &ActionRequest, _plan: &SandboxPlan) -> Result<StreamSession> {
        self.open_session(request).await
    }

    fn is_available(&self) -> bool {
        Self::is_command_available(self.shell.program())
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ShellAdapter {
        ShellAdapter::new(
            &ExecutionSettings {
                kill_grace_ms: 500,
                max_output_bytes: 64,
                ..Default::default()
            },
            &StreamSettings::default(),
        )
    }

    #[test]
    fn test_posix_argv_keeps_args_discrete() {
        let argv = ShellKind::Sh.argv("echo", &["a b".to_string(), "$(rm -rf /)".to_string()]);
        assert_eq!(
            argv,
            vec!["sh", "-c", "echo \"$@\"", "sh", "a b", "$(rm -rf /)"]
        );
        assert_eq!(ShellKind::Bash.argv("ls -la", &[]), vec!["bash", "-c", "ls -la"]);
    }

    #[test]
    fn test_windows_quoting() {
        assert_eq!(powershell_quote("it's"), "'it''s'");
        let argv = ShellKind::PowerShell.argv("Write-Output", &["$env:PATH".to_string()]);
        assert_eq!(argv.last().unwrap(), "Write-Output '$env:PATH'");

        assert_eq!(cmd_quote("a&b"), "a^&b");
        assert_eq!(cmd_quote("two words"), "\"two words\"");
        assert_eq!(cmd_quote(""), "\"\"");
    }

    #[test]
    fn test_bounded_capture() {
        let mut capture = BoundedCapture::new(4);
        capture.push(b"ab");
        capture.push(b"cdef");
        let (text, truncated) = capture.finish();
        assert!(truncated);
        assert!(text.starts_with("abcd"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_output() {
        let output = adapter()
            .execute("echo", &["hello".to_string()], None, &HashMap::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.status, ExecStatus::Completed);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_stderr_and_exit_code() {
        let output = adapter()
            .execute("echo oops >&2; exit 3", &[], None, &HashMap::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr, "oops\n");
        assert!(output.stdout.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_truncates() {
        let output = adapter()
            .execute("yes | head -c 1000", &[], None, &HashMap::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(output.stdout_truncated);
        assert!(output.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_scrubs_and_overrides_env() {
        std::env::set_var("CLAWMATE_TEST_SECRET_TOKEN", "leak");
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let output = adapter()
            .execute(
                "echo \"$GREETING:$CLAWMATE_TEST_SECRET_TOKEN\"",
                &[],
                None,
                &env,
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi:\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_within_grace() {
        let adapter = adapter();
        let timeout = Duration::from_secs(1);
        let started = Instant::now();
        let output = adapter
            .execute("sleep", &["5".to_string()], None, &HashMap::new(), timeout)
            .await
            .unwrap();
        assert_eq!(output.status, ExecStatus::TimedOut);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() <= timeout + adapter.kill_grace() + Duration::from_millis(500));

        let result = output.into_result(ActionId::new());
        assert!(result.is_timed_out());
        assert_eq!(
            result.error_kind(),
            Some(claw_foundation::ErrorKind::ExecutionTimeout)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let output = adapter()
            .execute_cancellable("sleep 5", &[], None, &HashMap::new(), Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert_eq!(output.status, ExecStatus::Killed);
        assert!(output.duration < Duration::from_secs(2));
    }

    #[test]
    fn test_describe() {
        let info = adapter().describe();
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.shell, ShellKind::default_for_os());
    }
}

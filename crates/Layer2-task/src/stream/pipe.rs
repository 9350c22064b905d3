//! Pipe-backed stream sessions
//!
//! Plain stdin/stdout/stderr pipes. Output keeps its stdout/stderr tag.

use super::session::{raw_channel, ChunkSource, ExitInfo, InputSink, ProcessControl, RawChunk, SessionParts};
use crate::action::{ActionId, Location};
use crate::executor::shell::{kill_tree, terminate_tree};
use async_trait::async_trait;
use claw_foundation::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

/// Control over a child spawned with pipes
struct PipeControl {
    pid: Option<u32>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ProcessControl for PipeControl {
    async fn terminate(&self) -> Result<()> {
        match self.pid {
            Some(pid) => terminate_tree(pid).await,
            None => Ok(()),
        }
    }

    async fn kill(&self) -> Result<()> {
        if let Some(pid) = self.pid {
            kill_tree(pid).await?;
        }
        self.kill.notify_one();
        Ok(())
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {}", pid),
            None => "pid ?".to_string(),
        }
    }
}

/// Spawn `argv` with piped stdio and hand it over as session parts
pub(crate) fn spawn(
    request_id: ActionId,
    argv: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    chunk_size: usize,
) -> Result<SessionParts> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidRequest("empty argv".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to spawn '{}': {}", program, e),
        ))
    })?;
    let pid = child.id();
    debug!("pipe session spawned {} (pid {:?})", program, pid);

    let (raw_tx, raw_rx) = raw_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_into(stdout, ChunkSource::Stdout, raw_tx.clone(), chunk_size));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_into(stderr, ChunkSource::Stderr, raw_tx, chunk_size));
    }
    let input = child
        .stdin
        .take()
        .map(|stdin| InputSink::Async(Box::pin(stdin)));

    let kill = Arc::new(Notify::new());
    let (exit_tx, exit_rx) = watch::channel(None);
    let waiter_kill = kill.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = waiter_kill.notified() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = status.ok().and_then(|s| s.code());
        let _ = exit_tx.send(Some(ExitInfo { code }));
    });

    Ok(SessionParts {
        request_id,
        location: Location::Host,
        raw: raw_rx,
        input,
        process: Arc::new(PipeControl { pid, kill }),
        exit: exit_rx,
    })
}

async fn read_into<R>(mut reader: R, source: ChunkSource, tx: mpsc::Sender<RawChunk>, chunk_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = RawChunk {
                    source,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

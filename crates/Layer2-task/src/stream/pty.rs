//! PTY-backed stream sessions
//!
//! Uses portable-pty so interactive programs see a real terminal. The PTY
//! merges stdout and stderr, so every chunk is tagged [`ChunkSource::Pty`].

use super::session::{raw_channel, ChunkSource, ExitInfo, InputSink, ProcessControl, RawChunk, SessionParts};
use crate::action::{ActionId, Location};
use crate::executor::shell::{kill_tree, terminate_tree};
use async_trait::async_trait;
use claw_foundation::{Error, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

struct PtyControl {
    pid: Option<u32>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
}

#[async_trait]
impl ProcessControl for PtyControl {
    async fn terminate(&self) -> Result<()> {
        match self.pid {
            // the child leads its own session, so its pid is the group id
            Some(pid) => terminate_tree(pid).await,
            None => self.kill().await,
        }
    }

    async fn kill(&self) -> Result<()> {
        if let Some(pid) = self.pid {
            if let Err(e) = kill_tree(pid).await {
                debug!("group kill failed for {}: {}", pid, e);
            }
        }
        match self.killer.lock().kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(rows, cols))
            .map_err(|e| Error::Internal(format!("failed to resize PTY: {}", e)))
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pty pid {}", pid),
            None => "pty".to_string(),
        }
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `argv` under a new pseudo-terminal
pub(crate) fn spawn(
    request_id: ActionId,
    argv: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    rows: u16,
    cols: u16,
    chunk_size: usize,
) -> Result<SessionParts> {
    if argv.is_empty() {
        return Err(Error::InvalidRequest("empty argv".into()));
    }

    let pair = native_pty_system()
        .openpty(pty_size(rows, cols))
        .map_err(|e| Error::Internal(format!("failed to open PTY: {}", e)))?;

    let mut cmd = CommandBuilder::from_argv(argv.iter().map(Into::into).collect());
    cmd.env_clear();
    for (key, value) in env {
        cmd.env(key, value);
    }
    if !env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::Internal(format!("failed to spawn PTY command: {}", e)))?;
    // the child holds its own slave handle; ours would keep the reader open
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::Internal(format!("failed to clone PTY reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::Internal(format!("failed to take PTY writer: {}", e)))?;
    debug!("pty session spawned {} (pid {:?})", argv[0], pid);

    let (raw_tx, raw_rx) = raw_channel();
    let chunk_size = chunk_size.max(1);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; chunk_size];
        loop {
            // EIO once the slave side is gone
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = RawChunk {
                        source: ChunkSource::Pty,
                        data: buf[..n].to_vec(),
                    };
                    if raw_tx.blocking_send(chunk).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) if status.success() => Some(0),
            Ok(status) if status.signal().is_some() => None,
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!("failed to wait for PTY child: {}", e);
                None
            }
        };
        let _ = exit_tx.send(Some(ExitInfo { code }));
    });

    Ok(SessionParts {
        request_id,
        location: Location::Host,
        raw: raw_rx,
        input: Some(InputSink::Blocking(writer)),
        process: Arc::new(PtyControl {
            pid,
            killer: Mutex::new(killer),
            master: Mutex::new(pair.master),
        }),
        exit: exit_rx,
    })
}

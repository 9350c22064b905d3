//! Stream Session
//!
//! A live channel between one running process (PTY, pipes or container exec)
//! and at most one subscriber at a time.
//!
//! ```text
//! process ──► reader ──► raw channel ──► pump ──► subscriber channel ──► ChunkStream
//!                        (small)                  (capacity = watermark)
//! ```
//!
//! When the subscriber channel is full the pump stops draining the raw channel,
//! readers block, and the process stalls on its own output. If the subscriber
//! channel stays full for `backpressure_grace` the session is force-closed.
//!
//! After the process exits the session stays open until the subscriber has
//! taken every chunk, or until delivery stalls for `flush_grace`.

use crate::action::{ActionFailure, ActionId, ActionResult, ExecMode, ExecStatus, Location};
use async_trait::async_trait;
use claw_foundation::{Error, Result, StreamSettings};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the reader → pump channel
const RAW_CAPACITY: usize = 8;

// ============================================================================
// Types
// ============================================================================

/// Unique identifier for a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Which output channel produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkSource {
    Stdout,
    Stderr,
    /// Merged terminal output
    Pty,
}

/// One piece of output, numbered in production order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub seq: u64,
    pub source: ChunkSource,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Output as produced by a backend reader
#[derive(Debug)]
pub(crate) struct RawChunk {
    pub source: ChunkSource,
    pub data: Vec<u8>,
}

/// Exit observed by a backend waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

/// Progress of output towards the subscriber
#[derive(Debug, Clone, Copy, Default)]
struct Delivery {
    sent: u64,
    taken: u64,
    eof: bool,
}

impl Delivery {
    fn is_drained(&self) -> bool {
        self.eof && self.taken >= self.sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Requested,
    ProcessExited,
    TimedOut,
    Disconnected,
}

/// Process control behind a session
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Ask the process (and its children) to stop
    async fn terminate(&self) -> Result<()>;

    /// Kill immediately
    async fn kill(&self) -> Result<()>;

    /// Resize the terminal, where there is one
    async fn resize(&self, _rows: u16, _cols: u16) -> Result<()> {
        Err(Error::InvalidRequest("session has no terminal to resize".into()))
    }

    /// pid or container id, for logs
    fn describe(&self) -> String;
}

/// Input side of a session
pub(crate) enum InputSink {
    /// Blocking writer (PTY master), written on the blocking pool
    Blocking(Box<dyn Write + Send>),
    Async(Pin<Box<dyn AsyncWrite + Send>>),
}

/// Timing knobs for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Chunks buffered for the subscriber before reads pause
    pub watermark: usize,
    pub backpressure_grace: Duration,
    pub flush_grace: Duration,
    pub kill_grace: Duration,
    /// Wall-clock limit for the whole session
    pub timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn from_settings(settings: &StreamSettings, kill_grace: Duration) -> Self {
        Self {
            watermark: settings.buffer_watermark.max(1),
            backpressure_grace: settings.backpressure_grace(),
            flush_grace: settings.flush_grace(),
            kill_grace,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Everything a backend hands over when a session starts
pub(crate) struct SessionParts {
    pub request_id: ActionId,
    pub location: Location,
    pub raw: mpsc::Receiver<RawChunk>,
    pub input: Option<InputSink>,
    pub process: Arc<dyn ProcessControl>,
    pub exit: watch::Receiver<Option<ExitInfo>>,
}

/// Channel pair for backend readers
pub(crate) fn raw_channel() -> (mpsc::Sender<RawChunk>, mpsc::Receiver<RawChunk>) {
    mpsc::channel(RAW_CAPACITY)
}

// ============================================================================
// Session
// ============================================================================

type ReceiverSlot = Arc<Mutex<Option<mpsc::Receiver<OutputChunk>>>>;

struct SessionInner {
    id: SessionId,
    request_id: ActionId,
    location: Location,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
    /// Set by an explicit close; delivery stops at once
    cut: Arc<AtomicBool>,
    delivery: Arc<watch::Sender<Delivery>>,
    slot: ReceiverSlot,
    input: tokio::sync::Mutex<Option<InputSink>>,
    process: Arc<dyn ProcessControl>,
    exit: watch::Receiver<Option<ExitInfo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_lock: tokio::sync::Mutex<()>,
    reason: Mutex<Option<CloseReason>>,
    killed: AtomicBool,
    kill_grace: Duration,
    started: Instant,
}

/// Handle to a live stream session. Clones share the same session.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.inner.id)
            .field("request_id", &self.inner.request_id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamSession {
    /// Wire up a started backend and spawn the pump and monitor tasks
    pub(crate) fn start(parts: SessionParts, options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.watermark);
        let (delivery, delivery_rx) = watch::channel(Delivery::default());
        let inner = Arc::new(SessionInner {
            id: SessionId::new(),
            request_id: parts.request_id,
            location: parts.location,
            state: watch::channel(SessionState::Open).0,
            closed: AtomicBool::new(false),
            cut: Arc::new(AtomicBool::new(false)),
            delivery: Arc::new(delivery),
            slot: Arc::new(Mutex::new(Some(rx))),
            input: tokio::sync::Mutex::new(parts.input),
            process: parts.process,
            exit: parts.exit,
            tasks: Mutex::new(Vec::new()),
            close_lock: tokio::sync::Mutex::new(()),
            reason: Mutex::new(None),
            killed: AtomicBool::new(false),
            kill_grace: options.kill_grace,
            started: Instant::now(),
        });

        let pump = tokio::spawn(pump(
            Arc::downgrade(&inner),
            parts.raw,
            tx,
            inner.delivery.clone(),
            options.backpressure_grace,
        ));
        let monitor = tokio::spawn(monitor(
            Arc::downgrade(&inner),
            inner.exit.clone(),
            delivery_rx,
            options.flush_grace,
            options.timeout,
        ));
        inner.tasks.lock().extend([pump, monitor]);

        info!(
            session = %inner.id,
            request = %inner.request_id.short(),
            process = %inner.process.describe(),
            "stream session opened"
        );
        Self { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn request_id(&self) -> ActionId {
        self.inner.request_id
    }

    pub fn location(&self) -> &Location {
        &self.inner.location
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Exit of the underlying process, once observed
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit.borrow()
    }

    /// Attach the subscriber. Chunks already delivered to an earlier
    /// subscriber are not replayed.
    pub fn subscribe(&self) -> Result<ChunkStream> {
        if self.is_closed() {
            return Err(Error::InvalidRequest(format!(
                "stream session {} is closed",
                self.inner.id
            )));
        }
        let rx = self.inner.slot.lock().take().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "stream session {} already has a subscriber",
                self.inner.id
            ))
        })?;
        debug!(session = %self.inner.id, "subscriber attached");
        Ok(ChunkStream {
            rx: Some(rx),
            slot: Arc::downgrade(&self.inner.slot),
            cut: self.inner.cut.clone(),
            delivery: self.inner.delivery.clone(),
        })
    }

    /// Send input to the process
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidRequest(format!(
                "stream session {} is closed",
                self.inner.id
            )));
        }

        let mut guard = self.inner.input.lock().await;
        let sink = guard.take().ok_or_else(|| {
            Error::InvalidRequest(format!("stream session {} has no input", self.inner.id))
        })?;

        let (sink, result) = match sink {
            InputSink::Async(mut writer) => {
                let result = async {
                    writer.write_all(data).await?;
                    writer.flush().await
                }
                .await;
                (InputSink::Async(writer), result)
            }
            InputSink::Blocking(mut writer) => {
                let data = data.to_vec();
                let (writer, result) = tokio::task::spawn_blocking(move || {
                    let result = writer.write_all(&data).and_then(|_| writer.flush());
                    (writer, result)
                })
                .await
                .map_err(|e| Error::Internal(format!("input writer panicked: {}", e)))?;
                (InputSink::Blocking(writer), result)
            }
        };

        // a concurrent close drops the input
        if !self.is_closed() {
            *guard = Some(sink);
        }
        result.map_err(Error::Io)
    }

    /// Resize the session's terminal
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidRequest("terminal size must be non-zero".into()));
        }
        self.inner.process.resize(rows, cols).await
    }

    /// Close the session. Idempotent; returns once the process has exited
    /// or been killed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close_with(CloseReason::Requested).await
    }

    /// Wait for the process to exit without closing the session
    pub async fn wait(&self) -> Option<ExitInfo> {
        self.inner.wait_exit().await
    }

    /// Resolves once the session is closed, whoever closed it
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .is_ok();
    }

    /// Final result once the session is closed or the process has exited
    pub fn result(&self) -> ActionResult {
        let exit = self.exit_info();
        let reason = *self.inner.reason.lock();
        let killed = self.inner.killed.load(Ordering::SeqCst);

        let (status, failure) = match reason {
            Some(CloseReason::TimedOut) => (
                ExecStatus::TimedOut,
                Some(ActionFailure::from(&Error::ExecutionTimeout(
                    "stream session exceeded its time limit".into(),
                ))),
            ),
            Some(CloseReason::Disconnected) => (
                ExecStatus::Killed,
                Some(ActionFailure::from(&Error::StreamDisconnected(
                    "subscriber did not drain output within the backpressure grace period".into(),
                ))),
            ),
            _ if killed => (
                ExecStatus::Killed,
                Some(ActionFailure::from(&Error::Cancelled)),
            ),
            _ => (ExecStatus::Completed, None),
        };

        ActionResult {
            request_id: self.inner.request_id,
            exit_code: if status == ExecStatus::Completed {
                exit.and_then(|e| e.code)
            } else {
                None
            },
            status,
            mode: ExecMode::Streamed,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration_ms: self.inner.started.elapsed().as_millis() as u64,
            location: self.inner.location.clone(),
            failure,
        }
    }
}

impl SessionInner {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    async fn wait_exit(&self) -> Option<ExitInfo> {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }

    async fn close_with(&self, reason: CloseReason) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if *self.state.borrow() == SessionState::Closed {
            return Ok(());
        }
        self.state.send_replace(SessionState::Closing);
        self.reason.lock().get_or_insert(reason);
        if reason == CloseReason::Requested {
            self.cut.store(true, Ordering::SeqCst);
        }
        self.closed.store(true, Ordering::SeqCst);

        let mut outcome = Ok(());
        if !self.has_exited() {
            self.killed.store(true, Ordering::SeqCst);
            if let Err(e) = self.process.terminate().await {
                debug!(session = %self.id, "terminate failed: {}", e);
            }
            if tokio::time::timeout(self.kill_grace, self.wait_exit())
                .await
                .is_err()
            {
                warn!(
                    session = %self.id,
                    "process {} ignored termination, killing",
                    self.process.describe()
                );
                if let Err(e) = self.process.kill().await {
                    error!(session = %self.id, "kill failed: {}", e);
                    outcome = Err(e);
                }
                if tokio::time::timeout(self.kill_grace, self.wait_exit())
                    .await
                    .is_err()
                {
                    error!(session = %self.id, "process was not reaped after kill");
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Ok(mut input) = self.input.try_lock() {
            input.take();
        }

        self.state.send_replace(SessionState::Closed);
        info!(session = %self.id, reason = ?reason, "stream session closed");
        outcome
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || self.has_exited() {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let process = self.process.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            warn!(session = %self.id, "stream session dropped while running, killing process");
            handle.spawn(async move {
                let _ = process.kill().await;
            });
        }
    }
}

/// Close from inside a session task without aborting the caller
fn spawn_close(session: &Weak<SessionInner>, reason: CloseReason) {
    if let Some(inner) = session.upgrade() {
        tokio::spawn(async move {
            let _ = inner.close_with(reason).await;
        });
    }
}

async fn pump(
    session: Weak<SessionInner>,
    mut raw: mpsc::Receiver<RawChunk>,
    tx: mpsc::Sender<OutputChunk>,
    delivery: Arc<watch::Sender<Delivery>>,
    backpressure_grace: Duration,
) {
    let mut seq = 0u64;
    while let Some(chunk) = raw.recv().await {
        let chunk = OutputChunk {
            seq,
            source: chunk.source,
            data: chunk.data,
        };
        seq += 1;

        match tokio::time::timeout(backpressure_grace, tx.send(chunk)).await {
            Ok(Ok(())) => delivery.send_modify(|d| d.sent += 1),
            Ok(Err(_)) => return,
            Err(_) => {
                warn!("subscriber buffer full past grace period, force-closing stream");
                spawn_close(&session, CloseReason::Disconnected);
                return;
            }
        }
    }
    delivery.send_modify(|d| d.eof = true);
    debug!("stream output reached EOF after {} chunks", seq);
}

/// Wait until the subscriber has taken everything the process wrote, or
/// until delivery makes no progress for `grace`
async fn flush(delivery: &mut watch::Receiver<Delivery>, grace: Duration) {
    loop {
        let drained = delivery.borrow_and_update().is_drained();
        if drained {
            return;
        }
        match tokio::time::timeout(grace, delivery.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return,
        }
    }
}

async fn monitor(
    session: Weak<SessionInner>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
    mut delivery: watch::Receiver<Delivery>,
    flush_grace: Duration,
    timeout: Option<Duration>,
) {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => futures::future::pending::<()>().await,
        }
    };

    let exited = async { exit.wait_for(Option::is_some).await.is_ok() };

    tokio::select! {
        _ = exited => {
            flush(&mut delivery, flush_grace).await;
            spawn_close(&session, CloseReason::ProcessExited);
        }
        _ = deadline => {
            warn!("stream session timed out");
            spawn_close(&session, CloseReason::TimedOut);
        }
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Ordered output of a session. Ends once the process output has been fully
/// delivered, or at once on an explicit close. Dropping it detaches, leaving
/// the session buffering for the next subscriber.
pub struct ChunkStream {
    rx: Option<mpsc::Receiver<OutputChunk>>,
    slot: Weak<Mutex<Option<mpsc::Receiver<OutputChunk>>>>,
    cut: Arc<AtomicBool>,
    delivery: Arc<watch::Sender<Delivery>>,
}

impl Stream for ChunkStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cut.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        let polled = match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        };
        if let Poll::Ready(Some(_)) = &polled {
            self.delivery.send_modify(|d| d.taken += 1);
        }
        polled
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if let (Some(rx), Some(slot)) = (self.rx.take(), self.slot.upgrade()) {
            *slot.lock() = Some(rx);
        }
    }
}

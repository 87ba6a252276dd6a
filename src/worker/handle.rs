//! Worker process handle
//!
//! A `WorkerHandle` exclusively owns one spawned worker: its child process, its
//! stdio pipes and its lifecycle state. Stdout and stderr are drained by
//! background tasks so callers never block on the OS pipes. Requests go through
//! an [`Exchange`], which holds the only access to the worker's stdin/stdout for
//! the duration of one request and is consumed when it settles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{self, Diagnostic, WorkerMessage};
use crate::{Error, Result};

/// Recent stderr lines kept for failure reports
const DIAGNOSTIC_HISTORY: usize = 32;

/// Non-reply stdout lines kept per exchange
const BUFFERED_OUTPUT: usize = 64;

/// Stderr lines quoted in a failure detail
const DETAIL_LINES: usize = 5;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Launching,
    Ready,
    Busy,
    Idle,
    Terminating,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Launching => "launching",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Idle => "idle",
            WorkerState::Terminating => "terminating",
            WorkerState::Dead => "dead",
        }
    }

    /// States in which a new request may start
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Idle)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a worker, reported by the sessions listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub chat_id: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub last_used_at: DateTime<Utc>,
    pub idle_secs: u64,
}

enum StdoutEvent {
    Line(String),
    Closed,
}

/// Exclusive stdio side of a worker
struct WorkerIo {
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<StdoutEvent>,
    closed: bool,
}

impl WorkerIo {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::SendFailure("stdin already closed".to_string()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::SendFailure(format!("Failed to write to stdin: {}", e)))?;

        stdin
            .flush()
            .await
            .map_err(|e| Error::SendFailure(format!("Failed to flush stdin: {}", e)))
    }

    async fn next_event(&mut self) -> StdoutEvent {
        if self.closed {
            return StdoutEvent::Closed;
        }
        match self.events.recv().await {
            Some(StdoutEvent::Line(line)) => StdoutEvent::Line(line),
            Some(StdoutEvent::Closed) | None => {
                self.closed = true;
                StdoutEvent::Closed
            }
        }
    }

    /// Take output that arrived while no request was in flight
    fn drain_stale(&mut self) -> Vec<String> {
        let mut stale = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                StdoutEvent::Line(line) => stale.push(line),
                StdoutEvent::Closed => self.closed = true,
            }
        }
        stale
    }

    fn close_input(&mut self) {
        self.stdin.take();
    }
}

struct Lifecycle {
    state: WorkerState,
    last_used_at: Instant,
    last_used_wall: DateTime<Utc>,
}

impl Lifecycle {
    fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.last_used_wall = Utc::now();
    }
}

/// One live worker process bound to a chat session
pub struct WorkerHandle {
    session_id: String,
    pid: Option<u32>,
    lifecycle: Mutex<Lifecycle>,
    io: Arc<AsyncMutex<WorkerIo>>,
    child: Mutex<Option<Child>>,
    diagnostics: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerHandle {
    /// Take ownership of a freshly spawned child. The handle starts in `launching`.
    pub(crate) fn from_child(
        session_id: &str,
        mut child: Child,
        shutdown_grace: Duration,
    ) -> Result<Arc<Self>> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::SpawnFailure("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SpawnFailure("Failed to capture stdout".to_string()))?;

        let stderr = child.stderr.take();

        let (events_tx, events) = mpsc::unbounded_channel();
        spawn_stdout_reader(session_id.to_string(), stdout, events_tx);

        let diagnostics = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_HISTORY)));
        let stderr_task =
            stderr.map(|s| spawn_stderr_reader(session_id.to_string(), s, diagnostics.clone()));

        Ok(Arc::new(Self {
            session_id: session_id.to_string(),
            pid: child.id(),
            lifecycle: Mutex::new(Lifecycle {
                state: WorkerState::Launching,
                last_used_at: Instant::now(),
                last_used_wall: Utc::now(),
            }),
            io: Arc::new(AsyncMutex::new(WorkerIo {
                stdin: Some(stdin),
                events,
                closed: false,
            })),
            child: Mutex::new(Some(child)),
            diagnostics,
            stderr_task: Mutex::new(stderr_task),
            shutdown_grace,
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.lock().state
    }

    pub fn last_used_at(&self) -> Instant {
        self.lifecycle.lock().last_used_at
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let lifecycle = self.lifecycle.lock();
        WorkerSnapshot {
            chat_id: self.session_id.clone(),
            state: lifecycle.state,
            pid: self.pid,
            last_used_at: lifecycle.last_used_wall,
            idle_secs: lifecycle.last_used_at.elapsed().as_secs(),
        }
    }

    /// Whether the handle can still be returned to callers. An idle worker whose
    /// process has exited is marked `dead` here.
    pub fn is_available(&self) -> bool {
        let exited = self.process_exited();
        let mut lifecycle = self.lifecycle.lock();
        let state = lifecycle.state;
        match state {
            WorkerState::Terminating | WorkerState::Dead => false,
            WorkerState::Busy | WorkerState::Launching => true,
            WorkerState::Ready | WorkerState::Idle if exited => {
                tracing::info!("Worker for chat {} exited while idle", self.session_id);
                lifecycle.state = WorkerState::Dead;
                false
            }
            WorkerState::Ready | WorkerState::Idle => true,
        }
    }

    fn process_exited(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Wait for the `{"status":"ready"}` handshake
    pub(crate) async fn await_ready(&self, timeout: Duration) -> Result<()> {
        let mut io = self.io.lock().await;

        match tokio::time::timeout(timeout, self.read_handshake(&mut io)).await {
            Ok(Ok(())) => {
                let mut lifecycle = self.lifecycle.lock();
                if lifecycle.state != WorkerState::Launching {
                    return Err(Error::WorkerUnavailable(self.session_id.clone()));
                }
                lifecycle.state = WorkerState::Ready;
                lifecycle.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::LaunchTimeout(timeout)),
        }
    }

    async fn read_handshake(&self, io: &mut WorkerIo) -> Result<()> {
        loop {
            match io.next_event().await {
                StdoutEvent::Line(line) => match protocol::decode_line(&line) {
                    Some(WorkerMessage::Ready) => return Ok(()),
                    Some(WorkerMessage::Error(detail)) => {
                        return Err(Error::SpawnFailure(format!(
                            "Worker reported an error during startup: {}",
                            detail
                        )));
                    }
                    Some(_) => {
                        return Err(Error::SpawnFailure(format!(
                            "Unexpected handshake message: {}",
                            line.trim()
                        )));
                    }
                    None => {
                        tracing::debug!("Chat {} startup output: {}", self.session_id, line);
                    }
                },
                StdoutEvent::Closed => {
                    let detail = self
                        .failure_detail("Worker exited before reporting ready")
                        .await;
                    return Err(Error::SpawnFailure(detail));
                }
            }
        }
    }

    /// Start a request. Fails with `Busy` while another request is in flight.
    pub fn try_begin(self: &Arc<Self>) -> Result<Exchange> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            WorkerState::Ready | WorkerState::Idle => {}
            WorkerState::Busy => return Err(Error::Busy(self.session_id.clone())),
            _ => return Err(Error::WorkerUnavailable(self.session_id.clone())),
        }

        let io = self
            .io
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Busy(self.session_id.clone()))?;

        lifecycle.state = WorkerState::Busy;

        Ok(Exchange {
            handle: self.clone(),
            io,
            settled: false,
        })
    }

    /// Send one message and wait for its reply
    pub async fn dispatch(self: &Arc<Self>, message: &str, timeout: Duration) -> Result<String> {
        self.try_begin()?.send(message, timeout).await
    }

    fn finish_exchange(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == WorkerState::Busy {
            lifecycle.state = WorkerState::Idle;
            lifecycle.touch();
        }
    }

    /// Mark the worker `dead` and stop its process. `busy` goes straight to `dead`.
    pub(crate) fn retire(&self, reason: &str) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == WorkerState::Dead {
                return;
            }
            lifecycle.state = WorkerState::Dead;
        }
        tracing::warn!(
            "Retiring worker for chat {} (pid {:?}): {}",
            self.session_id,
            self.pid,
            reason
        );
        self.stop_process();
    }

    /// Reaper check: move a `ready`/`idle` worker unused for longer than `ttl`
    /// to `terminating`.
    pub(crate) fn try_mark_expired(&self, ttl: Duration, now: Instant) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.state.accepts_dispatch() {
            return false;
        }
        if now.saturating_duration_since(lifecycle.last_used_at) <= ttl {
            return false;
        }
        lifecycle.state = WorkerState::Terminating;
        true
    }

    /// Terminate regardless of state. The returned task completes once the
    /// process has exited or been killed.
    pub(crate) fn terminate(&self) -> Option<JoinHandle<()>> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != WorkerState::Dead {
                lifecycle.state = WorkerState::Terminating;
            }
        }
        let task = self.stop_process();
        self.lifecycle.lock().state = WorkerState::Dead;
        task
    }

    fn stop_process(&self) -> Option<JoinHandle<()>> {
        let mut child = self.child.lock().take()?;

        if let Ok(mut io) = self.io.try_lock() {
            io.close_input();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(stop_child(
                self.session_id.clone(),
                child,
                self.shutdown_grace,
            ))),
            Err(_) => {
                let _ = child.start_kill();
                None
            }
        }
    }

    /// Describe why the worker went away, quoting its recent stderr
    async fn failure_detail(&self, prefix: &str) -> String {
        let stderr_task = self.stderr_task.lock().take();
        if let Some(task) = stderr_task {
            // stderr usually closes right after stdout
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }

        let status = self
            .child
            .lock()
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten());

        let recent: Vec<String> = {
            let diagnostics = self.diagnostics.lock();
            let skip = diagnostics.len().saturating_sub(DETAIL_LINES);
            diagnostics.iter().skip(skip).cloned().collect()
        };

        let mut detail = prefix.to_string();
        if let Some(status) = status {
            detail.push_str(&format!(" ({})", status));
        }
        if !recent.is_empty() {
            detail.push_str(": ");
            detail.push_str(&recent.join(" | "));
        }
        detail
    }
}

/// One in-flight request against a worker.
///
/// Holds the worker's stdio exclusively; `send` consumes it, so each exchange
/// settles once. Dropping an unsent or unfinished exchange retires the worker,
/// since its protocol position is no longer known.
pub struct Exchange {
    handle: Arc<WorkerHandle>,
    io: OwnedMutexGuard<WorkerIo>,
    settled: bool,
}

impl Exchange {
    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    /// Write the message and wait for the correlated reply
    pub async fn send(mut self, message: &str, timeout: Duration) -> Result<String> {
        let outcome = match tokio::time::timeout(timeout, self.exchange(message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DispatchTimeout(timeout)),
        };
        self.settled = true;

        let retire = self.io.closed
            || match &outcome {
                Ok(_) => false,
                Err(e) => e.retires_worker(),
            };

        if retire {
            self.io.close_input();
            let reason = match &outcome {
                Ok(_) => "worker exited after replying".to_string(),
                Err(e) => e.to_string(),
            };
            self.handle.retire(&reason);
        } else {
            self.handle.finish_exchange();
        }

        outcome
    }

    async fn exchange(&mut self, message: &str) -> Result<String> {
        let stale = self.io.drain_stale();
        for line in &stale {
            tracing::debug!("Chat {} discarded output: {}", self.handle.session_id, line);
        }
        if self.io.closed {
            let detail = self.handle.failure_detail("Worker exited while idle").await;
            return Err(Error::Protocol(detail));
        }

        let line = protocol::encode_request(message)?;
        self.io.write_line(&line).await?;
        tracing::debug!(
            "Sent {} bytes to worker for chat {}",
            line.len(),
            self.handle.session_id
        );

        let mut buffered: VecDeque<String> = VecDeque::new();
        loop {
            match self.io.next_event().await {
                StdoutEvent::Line(line) => {
                    let message = protocol::decode_line(&line);
                    if let Some(reply) = message.and_then(WorkerMessage::into_reply) {
                        return reply;
                    }
                    tracing::trace!("Chat {} output: {}", self.handle.session_id, line);
                    if buffered.len() == BUFFERED_OUTPUT {
                        buffered.pop_front();
                    }
                    buffered.push_back(line);
                }
                StdoutEvent::Closed => return self.settle_from_output(&buffered).await,
            }
        }
    }

    /// The worker ended without a reply line: look once at its last output
    async fn settle_from_output(&self, buffered: &VecDeque<String>) -> Result<String> {
        let last = buffered.back().map(String::as_str).unwrap_or_default();
        let trailing = last.find('{').map(|start| &last[start..]);

        match trailing
            .and_then(protocol::decode_line)
            .and_then(WorkerMessage::into_reply)
        {
            Some(reply) => reply,
            None => {
                for line in buffered {
                    tracing::debug!("Chat {} output before exit: {}", self.handle.session_id, line);
                }
                let detail = self
                    .handle
                    .failure_detail("Worker exited with no valid response")
                    .await;
                Err(Error::Protocol(detail))
            }
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.settled {
            self.io.close_input();
            self.handle.retire("request abandoned before the worker replied");
        }
    }
}

fn spawn_stdout_reader(
    session_id: String,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<StdoutEvent>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            match read_lossy_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if events.send(StdoutEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("Worker stdout closed for chat {}", session_id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Error reading worker stdout for chat {}: {}", session_id, e);
                    break;
                }
            }
        }

        let _ = events.send(StdoutEvent::Closed);
    });
}

fn spawn_stderr_reader(
    session_id: String,
    stderr: ChildStderr,
    diagnostics: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();

        loop {
            let line = match read_lossy_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Error reading worker stderr for chat {}: {}", session_id, e);
                    break;
                }
            };
            match protocol::classify_diagnostic(&line) {
                Diagnostic::Noise => {
                    tracing::trace!("Chat {} worker: {}", session_id, line);
                }
                Diagnostic::Error => {
                    tracing::warn!("Chat {} worker stderr: {}", session_id, line);
                    let mut diagnostics = diagnostics.lock();
                    if diagnostics.len() == DIAGNOSTIC_HISTORY {
                        diagnostics.pop_front();
                    }
                    diagnostics.push_back(line);
                }
            }
        }
    })
}

/// Read one line, replacing invalid UTF-8 instead of failing on it.
/// Returns `None` at end of stream.
async fn read_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn stop_child(session_id: String, mut child: Child, grace: Duration) {
    tokio::select! {
        status = child.wait() => {
            tracing::info!("Worker for chat {} exited with status: {:?}", session_id, status);
        }
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("Worker for chat {} did not exit gracefully, killing...", session_id);
            child.kill().await.ok();
        }
    }
}

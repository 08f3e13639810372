//! Child-process stdio transport.
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC over
//! its stdin/stdout. Stderr is forwarded to the log, tagged with the server
//! id. Teardown is SIGTERM, a grace period, then SIGKILL.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tether_types::{StdioConfig, TransportError};
use tether_wire::{codec, Frame};

use crate::{ConnectionState, StateCell, Transport, TransportEvent};

/// Capacity of the stdin write queue; a full queue suspends senders, which is
/// how OS-level backpressure reaches callers.
const WRITE_QUEUE: usize = 64;

struct StdioInner {
    child: Arc<Mutex<Child>>,
    pid: Option<u32>,
    write_tx: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
}

/// Stdio transport: one child process, one writer, one reader.
pub struct StdioTransport {
    server_id: String,
    config: StdioConfig,
    state: Arc<StateCell>,
    inner: Mutex<Option<StdioInner>>,
}

impl StdioTransport {
    pub fn new(
        server_id: &str,
        config: StdioConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            config,
            state: Arc::new(StateCell::new(events)),
            inner: Mutex::new(None),
        }
    }

    fn spawn_failed(&self, detail: impl Into<String>) -> TransportError {
        self.state.set(ConnectionState::Error);
        TransportError::SpawnFailed {
            command: self.config.command.clone(),
            source: std::io::Error::other(detail.into()),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Release the task-held Arcs so the child (kill_on_drop) is reaped
        // even when the owner skipped disconnect().
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(inner) = inner.take() {
                for task in inner.tasks {
                    task.abort();
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.state.set(ConnectionState::Error);
            TransportError::SpawnFailed {
                command: self.config.command.clone(),
                source: e,
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_failed("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_failed("failed to capture child stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.spawn_failed("failed to capture child stderr"))?;

        // Readiness: give the process a beat, then make sure it is still up.
        tokio::time::sleep(Duration::from_millis(self.config.ready_delay_ms)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(self.spawn_failed(format!("process exited during startup: {status}")));
        }

        let pid = child.id();
        let closing = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(child));
        let mut tasks = Vec::with_capacity(3);

        // Writer task: drains the queue into child stdin, one line per frame.
        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_QUEUE);
        let writer_state = Arc::clone(&self.state);
        tasks.push(tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = write_rx.recv().await {
                let result = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = result {
                    writer_state.emit(TransportEvent::Error(TransportError::WriteFailed(
                        e.to_string(),
                    )));
                    break;
                }
            }
        }));

        // Reader task: one frame per stdout line; EOF while connected means
        // the process died out from under us.
        let reader_state = Arc::clone(&self.state);
        let reader_child = Arc::clone(&child);
        let reader_closing = Arc::clone(&closing);
        let reader_server_id = self.server_id.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match codec::decode(&line) {
                    Ok(frame) => reader_state.emit(TransportEvent::Message(frame)),
                    Err(e) => {
                        tracing::warn!(
                            server_id = %reader_server_id,
                            error = %e,
                            "dropping malformed frame from server stdout"
                        );
                        reader_state.emit(TransportEvent::Malformed(e));
                    }
                }
            }
            if reader_closing.load(Ordering::SeqCst) {
                return;
            }
            // Unexpected EOF: collect the exit status and report it. Polled
            // rather than awaited so disconnect() can still take the child
            // lock for its own teardown.
            let mut status = None;
            for _ in 0..10 {
                if let Ok(Some(s)) = reader_child.lock().await.try_wait() {
                    status = Some(s);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if reader_closing.load(Ordering::SeqCst) {
                return;
            }
            let code = status.and_then(|s| s.code());
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.and_then(|s| s.signal())
            };
            #[cfg(not(unix))]
            let signal = None;
            tracing::warn!(
                server_id = %reader_server_id,
                code = ?code,
                signal = ?signal,
                "server process exited unexpectedly"
            );
            reader_state.emit(TransportEvent::Error(TransportError::ProcessExited {
                code,
                signal,
            }));
            reader_state.set(ConnectionState::Error);
        }));

        // Stderr task: free-form server logging, forwarded line by line.
        let stderr_server_id = self.server_id.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server_id = %stderr_server_id, "server stderr: {line}");
            }
        }));

        *inner = Some(StdioInner {
            child,
            pid,
            write_tx,
            tasks,
            closing,
        });
        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(inner) = self.inner.lock().await.take() else {
            self.state.set(ConnectionState::Disconnected);
            return;
        };
        inner.closing.store(true, Ordering::SeqCst);

        // Ask nicely first.
        #[cfg(unix)]
        if let Some(pid) = inner.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let grace = Duration::from_millis(self.config.grace_shutdown_ms);
        let waited = tokio::time::timeout(grace, async {
            inner.child.lock().await.wait().await
        })
        .await;
        match waited {
            Ok(Ok(status)) => {
                tracing::debug!(server_id = %self.server_id, ?status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server_id = %self.server_id, error = %e, "error waiting for server process");
            }
            Err(_) => {
                tracing::warn!(server_id = %self.server_id, "server process ignored SIGTERM, killing");
                let mut child = inner.child.lock().await;
                if let Err(e) = child.kill().await {
                    tracing::warn!(server_id = %self.server_id, error = %e, "failed to kill server process");
                }
            }
        }

        for task in inner.tasks {
            task.abort();
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let write_tx = {
            let inner = self.inner.lock().await;
            match inner.as_ref() {
                Some(inner) if self.state.get() == ConnectionState::Connected => {
                    inner.write_tx.clone()
                }
                _ => return Err(TransportError::NotConnected),
            }
        };
        let line =
            codec::encode(frame).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        write_tx
            .send(line)
            .await
            .map_err(|_| TransportError::WriteFailed("writer task has stopped".into()))
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

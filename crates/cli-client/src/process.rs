//! Subprocess channel: spawn a CLI with piped stdio and expose it as a
//! line stream plus a backpressured line writer.
//!
//! The writer funnels through a bounded channel, so callers awaiting
//! [`CliProcess::write_line`] are naturally backpressured instead of
//! buffering unboundedly when the child stops reading.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors that can occur on the subprocess channel.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("CLI process has exited")]
    Exited,

    #[error("failed to capture child {0}")]
    Pipe(&'static str),
}

/// Something the child did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One complete line from stdout (CR/LF stripped, never empty).
    Line(String),
    /// One line from stderr; surfaced for debug logging only.
    Stderr(String),
    /// The child exited. Terminal; no further events follow.
    Exited(Option<i32>),
}

/// How to launch the CLI.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Handle to a spawned CLI child. Cheap to clone; all clones share the
/// same stdin queue and liveness flag.
#[derive(Clone)]
pub struct CliProcess {
    stdin_tx: mpsc::Sender<String>,
    alive: Arc<AtomicBool>,
    kill: CancellationToken,
    pid: Option<u32>,
}

/// Stdin queue depth. Small on purpose: a stalled child should stall the
/// caller, not grow a buffer.
const STDIN_QUEUE: usize = 64;

impl CliProcess {
    /// Spawn the child and start the reader/writer/exit tasks.
    ///
    /// Returns the handle plus the event stream. The stream ends with
    /// exactly one [`ProcessEvent::Exited`].
    pub fn spawn(spec: &CommandSpec) -> Result<(Self, mpsc::Receiver<ProcessEvent>), ProcessError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(ProcessError::Io)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(ProcessError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;

        let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(256);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));
        let kill = CancellationToken::new();

        // Stdout reader: split into lines, tolerating CRLF and partial
        // reads (BufReader::read_line only completes on '\n').
        let stdout_events = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']);
                        if trimmed.is_empty() {
                            continue;
                        }
                        if stdout_events
                            .send(ProcessEvent::Line(trimmed.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "stdout read error");
                        break;
                    }
                }
            }
        });

        // Stderr reader: human logs, debug-level only.
        let stderr_events = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                        if trimmed.is_empty() {
                            continue;
                        }
                        tracing::debug!(line = %trimmed, "cli stderr");
                        if stderr_events
                            .send(ProcessEvent::Stderr(trimmed))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Stdin writer: drains the queue in FIFO order.
        let writer_alive = alive.clone();
        let mut stdin = stdin;
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    tracing::debug!(error = %e, "stdin write failed, closing writer");
                    writer_alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // Exit watcher: owns the child. Waits for natural exit or the
        // kill token, whichever first.
        let exit_alive = alive.clone();
        let exit_kill = kill.clone();
        tokio::spawn(async move {
            let natural = tokio::select! {
                status = child.wait() => Some(status),
                _ = exit_kill.cancelled() => None,
            };
            let code = match natural {
                Some(Ok(status)) => status.code(),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "error waiting for CLI process");
                    None
                }
                None => {
                    // Kill requested; `kill` also reaps the child.
                    if let Err(e) = child.kill().await {
                        tracing::debug!(error = %e, "kill failed (already gone?)");
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            exit_alive.store(false, Ordering::SeqCst);
            let _ = event_tx.send(ProcessEvent::Exited(code)).await;
        });

        Ok((
            Self {
                stdin_tx,
                alive,
                kill,
                pid,
            },
            event_rx,
        ))
    }

    /// Queue one line for the child's stdin. Awaits queue capacity
    /// (backpressure) and fails once the process is gone.
    pub async fn write_line(&self, line: String) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::Exited);
        }
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| ProcessError::Exited)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the exit watcher to kill the child. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// A process handle not backed by a child: written lines land in the
    /// returned receiver instead of a real stdin. Used by transports that
    /// relay through something else (tmux panes) and by test harnesses.
    pub fn from_channel() -> (Self, mpsc::Receiver<String>) {
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
        (
            Self {
                stdin_tx,
                alive: Arc::new(AtomicBool::new(true)),
                kill: CancellationToken::new(),
                pid: None,
            },
            stdin_rx,
        )
    }
}

#[cfg(test)]
impl CliProcess {
    pub(crate) fn fake() -> (Self, mpsc::Receiver<String>) {
        Self::from_channel()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: vec![],
        }
    }

    async fn next_line(rx: &mut mpsc::Receiver<ProcessEvent>) -> String {
        loop {
            match rx.recv().await.expect("event stream ended") {
                ProcessEvent::Line(line) => return line,
                ProcessEvent::Stderr(_) => continue,
                ProcessEvent::Exited(code) => panic!("unexpected exit: {code:?}"),
            }
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let (process, mut events) = CliProcess::spawn(&sh("cat")).unwrap();
        process.write_line(r#"{"n":1}"#.into()).await.unwrap();
        assert_eq!(next_line(&mut events).await, r#"{"n":1}"#);
        process.kill();
    }

    #[tokio::test]
    async fn crlf_is_stripped() {
        let (process, mut events) =
            CliProcess::spawn(&sh(r#"printf 'one\r\ntwo\n'"#)).unwrap();
        assert_eq!(next_line(&mut events).await, "one");
        assert_eq!(next_line(&mut events).await, "two");
        let _ = process;
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let (_process, mut events) = CliProcess::spawn(&sh("exit 3")).unwrap();
        loop {
            match events.recv().await.expect("event stream ended") {
                ProcessEvent::Exited(code) => {
                    assert_eq!(code, Some(3));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn write_after_exit_fails() {
        let (process, mut events) = CliProcess::spawn(&sh("exit 0")).unwrap();
        // Drain to the exit event so liveness has flipped.
        loop {
            match events.recv().await {
                Some(ProcessEvent::Exited(_)) | None => break,
                _ => continue,
            }
        }
        let err = process.write_line("late".into()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Exited));
    }

    #[tokio::test]
    async fn kill_terminates_the_child() {
        let (process, mut events) = CliProcess::spawn(&sh("sleep 30")).unwrap();
        process.kill();
        loop {
            match events.recv().await.expect("event stream ended") {
                ProcessEvent::Exited(_) => break,
                _ => continue,
            }
        }
        assert!(!process.is_alive());
    }
}

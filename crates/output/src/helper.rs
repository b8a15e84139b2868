//! Helper process supervision.
//!
//! A helper is a subprocess driving one sink. It reports on stdout with
//! one JSON object per line; `{"type":"ready"}` means the sink is live.
//! Stderr is drained into the log. Stopping escalates from the protocol
//! shutdown message to SIGTERM to an unconditional kill, so it always
//! ends with the exit observed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use framebridge_common::config::HelperConfig;
use framebridge_common::error::{BridgeError, BridgeResult, ProcessExit};

use crate::backpressure::LatestFrame;
use crate::legacy::{encode_frame, LegacyHeader};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    /// Short name used in logs and errors.
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--flag value`.
    pub fn flag(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }
}

/// Readiness and shutdown timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTimeouts {
    pub ready: Duration,
    pub graceful: Duration,
    pub terminate: Duration,
}

impl Default for HelperTimeouts {
    fn default() -> Self {
        Self::from(&HelperConfig::default())
    }
}

impl From<&HelperConfig> for HelperTimeouts {
    fn from(config: &HelperConfig) -> Self {
        Self {
            ready: config.ready_timeout(),
            graceful: config.graceful_timeout(),
            terminate: config.terminate_timeout(),
        }
    }
}

/// One line of helper stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    Ready,
    Error {
        #[serde(default)]
        message: String,
    },
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        message: String,
    },
    Devices {
        #[serde(default)]
        devices: Vec<serde_json::Value>,
    },
    DeviceAdded {
        #[serde(default)]
        devices: Vec<serde_json::Value>,
    },
    DeviceRemoved {
        #[serde(default)]
        devices: Vec<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

impl HelperMessage {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

enum Input {
    Closed,
    Direct(ChildStdin),
    Pump {
        frames: Arc<LatestFrame>,
        task: JoinHandle<()>,
    },
}

/// A running helper.
pub struct HelperProcess {
    label: String,
    pid: Option<u32>,
    input: Input,
    ready: Option<oneshot::Receiver<()>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for HelperProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl HelperProcess {
    /// Start the helper. Fails with a process error if the binary is
    /// missing or cannot be executed.
    pub fn spawn(command: &HelperCommand) -> BridgeResult<Self> {
        let label = command.label.clone();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::process(format!(
                    "Failed to start helper '{label}' ({}): {e}",
                    command.program.display()
                ))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::process("Failed to capture helper stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::process("Failed to capture helper stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::process("Failed to capture helper stderr"))?;

        tracing::info!(
            helper = %label,
            pid = ?pid,
            program = %command.program.display(),
            args = ?command.args,
            "Helper process started"
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(read_stdout(label.clone(), stdout, ready_tx));
        tokio::spawn(drain_stderr(label.clone(), stderr));
        tokio::spawn(supervise(label.clone(), child, exit_tx, kill_rx));

        Ok(Self {
            label,
            pid,
            input: Input::Direct(stdin),
            ready: Some(ready_rx),
            exit: exit_rx,
            kill: Some(kill_tx),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the helper has exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Receiver that flips to `Some` when the helper exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Take the readiness signal so it can be awaited without holding the
    /// process. Only the first call returns `Some`.
    pub fn take_ready(&mut self) -> Option<ReadySignal> {
        self.ready.take().map(|ready| ReadySignal {
            label: self.label.clone(),
            ready,
            exit: self.exit.clone(),
        })
    }

    /// Switch stdin to the legacy push protocol. Frames offered to the
    /// returned slot are written as FRAME messages, newest first.
    pub fn start_frame_pump(&mut self) -> BridgeResult<Arc<LatestFrame>> {
        match std::mem::replace(&mut self.input, Input::Closed) {
            Input::Direct(stdin) => {
                let frames = Arc::new(LatestFrame::new());
                let task = tokio::spawn(pump_frames(self.label.clone(), stdin, frames.clone()));
                self.input = Input::Pump {
                    frames: frames.clone(),
                    task,
                };
                Ok(frames)
            }
            Input::Pump { frames, task } => {
                self.input = Input::Pump {
                    frames: frames.clone(),
                    task,
                };
                Ok(frames)
            }
            Input::Closed => Err(BridgeError::process(format!(
                "Helper '{}' stdin is closed",
                self.label
            ))),
        }
    }

    /// Stop the helper and return how it exited.
    ///
    /// Sends the protocol shutdown, waits `graceful`, sends SIGTERM, waits
    /// `terminate`, then kills and waits for the exit unconditionally.
    pub async fn shutdown(mut self, timeouts: &HelperTimeouts) -> ProcessExit {
        let mut exit = self.exit.clone();
        if let Some(status) = current_exit(&exit) {
            return status;
        }

        let started = tokio::time::Instant::now();
        let graceful_deadline = started + timeouts.graceful;
        match std::mem::replace(&mut self.input, Input::Closed) {
            Input::Direct(mut stdin) => {
                let write = async {
                    stdin.write_all(&LegacyHeader::shutdown().encode()).await?;
                    stdin.flush().await
                };
                if let Ok(Err(e)) = tokio::time::timeout_at(graceful_deadline, write).await {
                    tracing::debug!(helper = %self.label, error = %e, "Shutdown message not delivered");
                }
            }
            Input::Pump { frames, task } => {
                frames.close();
                let _ = tokio::time::timeout_at(graceful_deadline, task).await;
            }
            Input::Closed => {}
        }

        if let Ok(status) = tokio::time::timeout_at(graceful_deadline, wait_exit(&mut exit)).await {
            return status;
        }

        tracing::warn!(helper = %self.label, pid = ?self.pid, "Helper ignored shutdown; sending SIGTERM");
        self.terminate();
        if let Ok(status) = tokio::time::timeout(timeouts.terminate, wait_exit(&mut exit)).await {
            return status;
        }

        tracing::warn!(helper = %self.label, pid = ?self.pid, "Helper ignored SIGTERM; killing");
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        wait_exit(&mut exit).await
    }

    #[cfg(unix)]
    fn terminate(&self) {
        let Some(pid) = self.pid else { return };
        // Safety: plain signal delivery to a child we spawned; the pid is
        // only reused after the exit is reaped by the supervisor, which
        // has not happened yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            tracing::debug!(
                helper = %self.label,
                error = %std::io::Error::last_os_error(),
                "SIGTERM delivery failed"
            );
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

/// Pending readiness of a helper.
#[derive(Debug)]
pub struct ReadySignal {
    label: String,
    ready: oneshot::Receiver<()>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ReadySignal {
    /// Wait for `{"type":"ready"}`. Exiting first yields
    /// [`BridgeError::HelperExited`] carrying the exit code or signal.
    pub async fn wait(self, timeout: Duration) -> BridgeResult<()> {
        let Self {
            label,
            mut ready,
            mut exit,
        } = self;

        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                signal = &mut ready => match signal {
                    Ok(()) => Ok(()),
                    // Stdout closed without a ready line.
                    Err(_) => Err(wait_exit(&mut exit).await),
                },
                status = wait_exit(&mut exit) => match ready.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(status),
                },
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(helper = %label, "Helper ready");
                Ok(())
            }
            Ok(Err(status)) => {
                tracing::error!(
                    helper = %label,
                    code = ?status.code,
                    signal = ?status.signal,
                    "Helper exited before ready"
                );
                Err(BridgeError::HelperExited {
                    helper: label,
                    exit: status,
                })
            }
            Err(_) => Err(BridgeError::timeout(
                format!("helper '{label}' ready"),
                timeout.as_millis() as u64,
            )),
        }
    }
}

fn current_exit(rx: &watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    *rx.borrow()
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(status) = current {
            return status;
        }
        if rx.changed().await.is_err() {
            return current_exit(rx).unwrap_or_default();
        }
    }
}

async fn supervise(
    label: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    kill_rx: oneshot::Receiver<()>,
) {
    // A dropped kill sender means the handle is gone; kill in that case too.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(helper = %label, error = %e, "Failed to kill helper");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => exit_from_status(status),
        Err(e) => {
            tracing::warn!(helper = %label, error = %e, "Failed to observe helper exit");
            ProcessExit::default()
        }
    };
    tracing::info!(helper = %label, code = ?exit.code, signal = ?exit.signal, "Helper exited");
    exit_tx.send_replace(Some(exit));
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
    }
}

async fn read_stdout(label: String, stdout: ChildStdout, ready_tx: oneshot::Sender<()>) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(helper = %label, error = %e, "Helper stdout closed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match HelperMessage::parse(trimmed) {
            Some(HelperMessage::Ready) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                } else {
                    tracing::debug!(helper = %label, "Duplicate ready from helper");
                }
            }
            Some(HelperMessage::Error { message }) => {
                tracing::error!(helper = %label, message = %message, "Helper reported an error");
            }
            Some(HelperMessage::Log { level, message }) => match level.as_str() {
                "error" => tracing::error!(helper = %label, "{message}"),
                "warn" | "warning" => tracing::warn!(helper = %label, "{message}"),
                "debug" => tracing::debug!(helper = %label, "{message}"),
                _ => tracing::info!(helper = %label, "{message}"),
            },
            Some(HelperMessage::Devices { devices })
            | Some(HelperMessage::DeviceAdded { devices })
            | Some(HelperMessage::DeviceRemoved { devices }) => {
                tracing::info!(helper = %label, count = devices.len(), "Helper device event");
            }
            Some(HelperMessage::Unknown) => {
                tracing::debug!(helper = %label, line = %trimmed, "Unhandled helper message");
            }
            None => tracing::debug!(helper = %label, line = %trimmed, "Helper output"),
        }
    }
}

async fn drain_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::warn!(helper = %label, "{}", line.trim_end());
        }
    }
}

async fn pump_frames(label: String, mut stdin: ChildStdin, frames: Arc<LatestFrame>) {
    while let Some(frame) = frames.next().await {
        let message = match encode_frame(frame.width, frame.height, frame.timestamp_ns, &frame.rgba) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(helper = %label, error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        frames.set_can_send(false);
        let written = stdin.write_all(&message).await;
        frames.set_can_send(true);
        if let Err(e) = written {
            tracing::warn!(helper = %label, error = %e, "Helper stopped accepting frames");
            frames.close();
            return;
        }
    }

    let shutdown = LegacyHeader::shutdown().encode();
    if let Err(e) = stdin.write_all(&shutdown).await {
        tracing::debug!(helper = %label, error = %e, "Shutdown message not delivered");
    }
    let _ = stdin.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_messages_parse() {
        assert_eq!(HelperMessage::parse(r#"{"type":"ready"}"#), Some(HelperMessage::Ready));
        assert_eq!(
            HelperMessage::parse(r#"{"type":"error","message":"no device"}"#),
            Some(HelperMessage::Error {
                message: "no device".into()
            })
        );
        assert_eq!(
            HelperMessage::parse(r#"{"type":"stats","fps":50}"#),
            Some(HelperMessage::Unknown)
        );
        assert_eq!(HelperMessage::parse("plain text"), None);
    }

    #[test]
    fn command_builder_appends_flags() {
        let command = HelperCommand::new("display", "/usr/bin/display-helper")
            .flag("--width", 1920)
            .flag("--fps", 50.0);
        assert_eq!(command.args, vec!["--width", "1920", "--fps", "50"]);
    }
}

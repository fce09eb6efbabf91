//! Owns the child debugger process and its standard streams: spawning,
//! lifecycle tracking, graceful/forced shutdown, and the line-splitting
//! stream pumps that feed the executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use cdbx_core::error::SupervisorError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const GRACEFUL_STOP_GRACE: Duration = Duration::from_secs(5);
const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);
const QUIT_COMMAND: &str = "q";

/// Lifecycle of the supervised child process, observable via
/// [`ProcessManager::subscribe`] without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    /// The child exited. `expected` is true only when the exit happened
    /// during a caller-initiated [`ProcessManager::stop`].
    Exited { code: Option<i32>, expected: bool },
}

/// Outcome of a [`ProcessManager::start`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// One line of output read from a pumped stream.
#[derive(Debug, Clone)]
pub struct LineMessage {
    pub text: String,
    pub is_stderr: bool,
}

/// Environment variables forwarded to the child carrying symbol-server
/// knobs. No symbol-server semantics are interpreted here (out of scope);
/// these are opaque strings/numbers from this crate's point of view.
#[derive(Debug, Clone, Default)]
pub struct SymbolServerEnv {
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub search_path: Option<String>,
}

/// Owns the child process handle, its stdin writer, and the lifecycle watch
/// channel. Exactly one instance per session.
pub struct ProcessManager {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    state_tx: watch::Sender<ProcessState>,
    state_rx: watch::Receiver<ProcessState>,
    init_output_consumed: bool,
    stopping: bool,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ProcessState::NotStarted);
        Self {
            child: None,
            stdin: None,
            state_tx,
            state_rx,
            init_output_consumed: false,
            stopping: false,
        }
    }

    /// Observe lifecycle transitions without polling.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    /// True iff the process is `Ready` and its initial banner output has
    /// already been discarded (the manager never attempts to parse that
    /// banner for a prompt — the debugger emits none until the first
    /// command, spec §4.3).
    pub fn is_active(&self) -> bool {
        self.init_output_consumed && matches!(self.state(), ProcessState::Ready)
    }

    /// Spawn the child, redirecting all three standard streams and handing
    /// back pumps for stdout/stderr. Idempotent: a second call while already
    /// running returns `AlreadyRunning` without spawning again.
    ///
    /// Blocks for `startup_delay` after spawn, before the process is marked
    /// `Ready`, giving the debugger a minimum grace period to finish its own
    /// startup before the first command can be written (spec §6).
    ///
    /// Returns two unbounded receivers of [`LineMessage`] (stdout, stderr).
    pub async fn start(
        &mut self,
        target_args: &[String],
        executable_override: Option<&Path>,
        configured_path: Option<&Path>,
        symbol_env: &SymbolServerEnv,
        startup_delay: Duration,
    ) -> Result<(StartOutcome, mpsc::UnboundedReceiver<LineMessage>, mpsc::UnboundedReceiver<LineMessage>), SupervisorError>
    {
        if self.child.is_some() {
            return Ok((
                StartOutcome::AlreadyRunning,
                mpsc::unbounded_channel().1,
                mpsc::unbounded_channel().1,
            ));
        }

        let executable = resolve_executable(executable_override, configured_path)?;
        let _ = self.state_tx.send(ProcessState::Starting);

        let working_dir: PathBuf = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cmd = Command::new(&executable);
        cmd.args(target_args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_symbol_env(&mut cmd, symbol_env);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::LaunchFailure(format!("{}: {e}", executable.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::LaunchFailure("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::LaunchFailure("child stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::LaunchFailure("child stderr not piped".into()))?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        spawn_pump(stdout, stdout_tx, false);
        spawn_pump(stderr, stderr_tx, true);

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.init_output_consumed = true;
        self.stopping = false;

        if !startup_delay.is_zero() {
            tokio::time::sleep(startup_delay).await;
        }

        let _ = self.state_tx.send(ProcessState::Ready);
        info!(path = %executable.display(), "debugger child process ready");

        Ok((StartOutcome::Started, stdout_rx, stderr_rx))
    }

    /// Write `text` followed by a newline to the child's stdin. The single
    /// writer invariant (spec §5) is enforced by the executor serializing
    /// all calls to this method behind its own mutex; this method performs
    /// no internal locking.
    pub async fn write_line(&mut self, text: &str) -> Result<(), SupervisorError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SupervisorError::InvalidState("process not started".into()))?;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| SupervisorError::ChildIoFailure(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| SupervisorError::ChildIoFailure(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| SupervisorError::ChildIoFailure(e.to_string()))
    }

    /// Best-effort interrupt of whatever the debugger is currently doing:
    /// a Ctrl-C byte (0x03) followed by a period command. Does not forcibly
    /// terminate the child; callers still wait for a sentinel or timeout
    /// (spec §4.5). Errors are swallowed — this is advisory only.
    pub async fn interrupt(&mut self) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let _ = stdin.write_all(&[0x03]).await;
        let _ = stdin.write_all(b".\n").await;
        let _ = stdin.flush().await;
    }

    /// Graceful-then-forced shutdown. Idempotent: a second call after the
    /// process has already exited is a no-op returning `true`.
    pub async fn stop(&mut self) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        self.stopping = true;
        let _ = self.state_tx.send(ProcessState::Stopping);

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(QUIT_COMMAND.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        }

        let exit_code = match tokio::time::timeout(GRACEFUL_STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                warn!("debugger did not exit within the graceful grace period; force-killing");
                kill_child_process_group(&mut child);
                match tokio::time::timeout(FORCE_KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    _ => None,
                }
            }
        };

        self.init_output_consumed = false;
        let _ = self.state_tx.send(ProcessState::Exited {
            code: exit_code,
            expected: true,
        });
        true
    }

    /// Record an unexpected exit observed by a caller polling `child.wait()`
    /// out of band (e.g. a watcher task). Distinct from `stop()`'s expected
    /// exit so subscribers can tell a crash apart from a requested shutdown.
    pub fn record_unexpected_exit(&mut self, code: Option<i32>) {
        if self.stopping {
            return;
        }
        self.init_output_consumed = false;
        let _ = self.state_tx.send(ProcessState::Exited {
            code,
            expected: false,
        });
    }
}

fn resolve_executable(
    executable_override: Option<&Path>,
    configured_path: Option<&Path>,
) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = executable_override {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(SupervisorError::NotFound(format!(
            "executable override does not exist: {}",
            path.display()
        )));
    }
    if let Some(path) = configured_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(SupervisorError::NotFound(format!(
            "configured executable does not exist: {}",
            path.display()
        )));
    }
    Err(SupervisorError::NotFound(
        "no executable override or configured path provided".into(),
    ))
}

fn apply_symbol_env(cmd: &mut Command, symbol_env: &SymbolServerEnv) {
    if let Some(retries) = symbol_env.retries {
        cmd.env("CDBX_SYMBOL_SERVER_RETRIES", retries.to_string());
    }
    if let Some(timeout_secs) = symbol_env.timeout_secs {
        cmd.env("CDBX_SYMBOL_SERVER_TIMEOUT_SECS", timeout_secs.to_string());
    }
    if let Some(search_path) = &symbol_env.search_path {
        cmd.env("_NT_SYMBOL_PATH", search_path);
    }
}

/// Spawn the background task reading one stream, splitting it into lines on
/// `\r`, `\n`, or `\r\n`, and forwarding each onto `tx`. The channel is
/// unbounded so a slow consumer never backpressures the child's write side
/// (spec §4.4). A read error or EOF ends only this pump's task.
fn spawn_pump(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<LineMessage>,
    is_stderr: bool,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match read_until_line_break(&mut reader, &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    if tx
                        .send(LineMessage {
                            text,
                            is_stderr,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, is_stderr, "stream pump read error; stopping this pump");
                    break;
                }
            }
        }
    });
}

/// Read one line, treating a bare `\r` (common in CDB's progress output) as
/// a line terminator in addition to `\n`/`\r\n`.
async fn read_until_line_break(
    reader: &mut BufReader<impl tokio::io::AsyncRead + Unpin>,
    out: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        match byte[0] {
            b'\n' => return Ok(total),
            b'\r' => {
                // Peek for an immediately-following '\n' to collapse CRLF
                // into a single line break; otherwise treat the bare '\r'
                // itself as the terminator.
                let mut peek = [0u8; 1];
                if let Ok(1) = reader.read(&mut peek).await {
                    if peek[0] != b'\n' {
                        out.push(peek[0]);
                    }
                }
                return Ok(total);
            }
            b => out.push(b),
        }
    }
}

fn kill_child_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative PID targets the
            // whole process group created by setsid() at spawn time.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fake_debugger_script() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("fake_cdb.sh");
        let mut file = std::fs::File::create(&script_path).expect("create script");
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo 'Microsoft (R) Windows Debugger'").unwrap();
        writeln!(file, "while read -r line; do").unwrap();
        writeln!(file, "  if [ \"$line\" = \"q\" ]; then exit 0; fi").unwrap();
        writeln!(file, "  echo \"$line\"").unwrap();
        writeln!(file, "  echo '0:000> '").unwrap();
        writeln!(file, "done").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        (dir, script_path)
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let (_dir, script) = write_fake_debugger_script();
        let mut manager = ProcessManager::new();
        let (outcome, _out, _err) = manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("start succeeds");
        assert_eq!(outcome, StartOutcome::Started);

        let (outcome2, _out2, _err2) = manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("second start succeeds");
        assert_eq!(outcome2, StartOutcome::AlreadyRunning);

        manager.stop().await;
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let mut manager = ProcessManager::new();
        let err = manager
            .start(&[], None, None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_after_exit() {
        let (_dir, script) = write_fake_debugger_script();
        let mut manager = ProcessManager::new();
        manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("start succeeds");
        assert!(manager.stop().await);
        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn pump_delivers_lines_from_child_stdout() {
        let (_dir, script) = write_fake_debugger_script();
        let mut manager = ProcessManager::new();
        let (_outcome, mut stdout_rx, _stderr_rx) = manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("start succeeds");

        let banner = tokio::time::timeout(Duration::from_secs(2), stdout_rx.recv())
            .await
            .expect("banner arrives in time")
            .expect("channel open");
        assert!(banner.text.contains("Windows Debugger"));

        manager.stop().await;
    }
}

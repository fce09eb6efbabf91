//! Executes exactly one command at a time against the debugger child,
//! framed with sentinels, and correlates the resulting output back to the
//! caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cdbx_core::CommandResult;
use cdbx_core::sentinel::{BatchSentinels, Sentinels};
use cdbx_parser::{Classification, OutputParser};
use cdbx_process::{LineMessage, ProcessManager};
use chrono::Utc;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const STDERR_SEPARATOR: &str = "--- STDERR ---";

/// The three duration knobs that bound one command's execution (spec §6):
/// the overall command deadline, the maximum silence between two lines of
/// output, and how long to keep draining residual output once an end
/// sentinel has already been seen.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimeouts {
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
    pub output_read_timeout: Duration,
}

/// Single-consumer state: the pump receivers and the parser watching the
/// command currently in flight. Guarded by one mutex that doubles as the
/// "at most one execution in progress" primitive (spec §4.5, §5) — holding
/// the guard for a command's whole lifetime both serializes submissions in
/// FIFO lock-acquisition order and gives exclusive mutable access to the
/// receivers, so there is nothing further to synchronize.
struct ExecutorState {
    stdout_rx: mpsc::UnboundedReceiver<LineMessage>,
    stderr_rx: mpsc::UnboundedReceiver<LineMessage>,
    parser: OutputParser,
}

pub struct CommandExecutor {
    process: Arc<TokioMutex<ProcessManager>>,
    state: TokioMutex<ExecutorState>,
    session_cancel: CancellationToken,
    drained: AtomicBool,
}

impl CommandExecutor {
    pub fn new(
        process: Arc<TokioMutex<ProcessManager>>,
        stdout_rx: mpsc::UnboundedReceiver<LineMessage>,
        stderr_rx: mpsc::UnboundedReceiver<LineMessage>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            process,
            state: TokioMutex::new(ExecutorState {
                stdout_rx,
                stderr_rx,
                parser: OutputParser::new(),
            }),
            session_cancel,
            drained: AtomicBool::new(false),
        }
    }

    /// True once an unexpected child exit has been observed; the queue must
    /// stop dispatching further commands once this is set.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Execute one command, framed by a sentinel pair scoped to `command_id`.
    pub async fn execute(
        &self,
        command_id: &str,
        command_text: &str,
        timeouts: ExecutionTimeouts,
        external_cancel: CancellationToken,
    ) -> CommandResult {
        let sentinels = Sentinels::for_nonce(command_id);
        let framed = format!(
            ".echo {}; {}; .echo {}",
            sentinels.start_marker(),
            command_text,
            sentinels.end_marker()
        );
        self.run_framed(sentinels, &framed, command_text, timeouts, external_cancel)
            .await
    }

    /// Execute a semicolon-joined compound of `commands` wrapped in a single
    /// sentinel pair — no per-subcommand framing (spec §4.5 batch variant).
    pub async fn execute_batch(
        &self,
        batch_id: &str,
        commands: &[String],
        timeouts: ExecutionTimeouts,
        external_cancel: CancellationToken,
    ) -> CommandResult {
        let batch = BatchSentinels::for_nonce(batch_id);
        let sentinels = Sentinels::from_markers(batch.start_marker(), batch.end_marker());
        let joined = commands.join("; ");
        let framed = format!(
            ".echo {}; {}; .echo {}",
            batch.start_marker(),
            joined,
            batch.end_marker()
        );
        self.run_framed(sentinels, &framed, &joined, timeouts, external_cancel)
            .await
    }

    async fn run_framed(
        &self,
        sentinels: Sentinels,
        framed_line: &str,
        original_command: &str,
        timeouts: ExecutionTimeouts,
        external_cancel: CancellationToken,
    ) -> CommandResult {
        let queued_at = Utc::now();

        if self.drained.load(Ordering::Acquire) {
            return CommandResult::failure(
                String::new(),
                "session terminated".to_string(),
                original_command.to_string(),
                queued_at,
                None,
                Utc::now(),
            );
        }

        let mut state = self.state.lock().await;
        state.parser.set_current_command(sentinels);
        let started_at = Utc::now();

        if let Err(write_err) = self.process.lock().await.write_line(framed_line).await {
            warn!(error = %write_err, "failed to write framed command to debugger stdin");
            state.parser.clear_current_command();
            return CommandResult::failure(
                String::new(),
                write_err.user_visible_phrase(),
                original_command.to_string(),
                queued_at,
                Some(started_at),
                Utc::now(),
            );
        }

        let result = self
            .collect_until_complete(
                &mut state,
                original_command,
                queued_at,
                started_at,
                timeouts,
                external_cancel,
            )
            .await;

        state.parser.clear_current_command();
        result
    }

    async fn collect_until_complete(
        &self,
        state: &mut ExecutorState,
        original_command: &str,
        queued_at: chrono::DateTime<Utc>,
        started_at: chrono::DateTime<Utc>,
        timeouts: ExecutionTimeouts,
        external_cancel: CancellationToken,
    ) -> CommandResult {
        let mut in_command = false;
        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();

        let sleep = tokio::time::sleep(timeouts.command_timeout);
        tokio::pin!(sleep);
        let idle_sleep = tokio::time::sleep(timeouts.idle_timeout);
        tokio::pin!(idle_sleep);

        loop {
            tokio::select! {
                biased;

                _ = self.session_cancel.cancelled() => {
                    self.best_effort_interrupt().await;
                    return CommandResult::failure(
                        render_partial(&stdout_lines, &stderr_lines),
                        "session cancelled".to_string(),
                        original_command.to_string(),
                        queued_at,
                        Some(started_at),
                        Utc::now(),
                    );
                }

                _ = external_cancel.cancelled() => {
                    self.best_effort_interrupt().await;
                    return CommandResult::failure(
                        render_partial(&stdout_lines, &stderr_lines),
                        "command cancelled: caller requested cancellation".to_string(),
                        original_command.to_string(),
                        queued_at,
                        Some(started_at),
                        Utc::now(),
                    );
                }

                () = &mut sleep => {
                    self.best_effort_interrupt().await;
                    let elapsed_ms = timeouts.command_timeout.as_millis() as u64;
                    return CommandResult::failure(
                        render_partial(&stdout_lines, &stderr_lines),
                        format!("command timed out after {elapsed_ms}ms"),
                        original_command.to_string(),
                        queued_at,
                        Some(started_at),
                        Utc::now(),
                    );
                }

                () = &mut idle_sleep => {
                    self.best_effort_interrupt().await;
                    let elapsed_ms = timeouts.idle_timeout.as_millis() as u64;
                    return CommandResult::failure(
                        render_partial(&stdout_lines, &stderr_lines),
                        format!("command timed out after {elapsed_ms}ms of debugger silence"),
                        original_command.to_string(),
                        queued_at,
                        Some(started_at),
                        Utc::now(),
                    );
                }

                maybe_line = state.stdout_rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            idle_sleep.as_mut().reset(tokio::time::Instant::now() + timeouts.idle_timeout);
                            if self.handle_line(&state.parser, line, false, &mut in_command, &mut stdout_lines, &mut stderr_lines) {
                                self.drain_residual_output(state, timeouts.output_read_timeout).await;
                                return CommandResult::success(
                                    render_output(&stdout_lines, &stderr_lines),
                                    original_command.to_string(),
                                    queued_at,
                                    started_at,
                                    Utc::now(),
                                );
                            }
                        }
                        None => {
                            warn!("stdout pump channel closed; debugger process likely exited");
                            self.drained.store(true, Ordering::Release);
                            return CommandResult::failure(
                                render_partial(&stdout_lines, &stderr_lines),
                                "session terminated: debugger process exited unexpectedly".to_string(),
                                original_command.to_string(),
                                queued_at,
                                Some(started_at),
                                Utc::now(),
                            );
                        }
                    }
                }

                maybe_line = state.stderr_rx.recv() => {
                    if let Some(line) = maybe_line {
                        idle_sleep.as_mut().reset(tokio::time::Instant::now() + timeouts.idle_timeout);
                        if self.handle_line(&state.parser, line, true, &mut in_command, &mut stdout_lines, &mut stderr_lines) {
                            self.drain_residual_output(state, timeouts.output_read_timeout).await;
                            return CommandResult::success(
                                render_output(&stdout_lines, &stderr_lines),
                                original_command.to_string(),
                                queued_at,
                                started_at,
                                Utc::now(),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Classify one line and fold it into the in-progress buffers. Returns
    /// `true` once an end sentinel or heuristic completion marker is seen.
    fn handle_line(
        &self,
        parser: &OutputParser,
        line: LineMessage,
        is_stderr: bool,
        in_command: &mut bool,
        stdout_lines: &mut Vec<String>,
        stderr_lines: &mut Vec<String>,
    ) -> bool {
        match parser.classify(&line.text) {
            Classification::StartSentinel => {
                *in_command = true;
                stdout_lines.clear();
                stderr_lines.clear();
                false
            }
            Classification::EndSentinel | Classification::Complete(_) => {
                *in_command = false;
                true
            }
            Classification::Payload => {
                if *in_command {
                    if is_stderr {
                        stderr_lines.push(line.text);
                    } else {
                        stdout_lines.push(line.text);
                    }
                }
                false
            }
        }
    }

    /// Keep consuming both streams for up to `output_read_timeout` after a
    /// command has completed, discarding whatever residual lines the
    /// debugger emits right after its end sentinel, so they cannot leak
    /// into the next command's classification (spec §6).
    async fn drain_residual_output(&self, state: &mut ExecutorState, output_read_timeout: Duration) {
        let deadline = tokio::time::sleep(output_read_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return,
                maybe_line = state.stdout_rx.recv() => {
                    if maybe_line.is_none() {
                        return;
                    }
                }
                maybe_line = state.stderr_rx.recv() => {
                    if maybe_line.is_none() {
                        return;
                    }
                }
            }
        }
    }

    async fn best_effort_interrupt(&self) {
        self.process.lock().await.interrupt().await;
    }
}

fn render_output(stdout_lines: &[String], stderr_lines: &[String]) -> String {
    let mut output = stdout_lines.join("\n");
    if !stderr_lines.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(STDERR_SEPARATOR);
        output.push('\n');
        output.push_str(&stderr_lines.join("\n"));
    }
    output
}

/// Same rendering used for a command that never reached an end sentinel
/// (cancelled, timed out, or the process exited mid-command) — whatever
/// payload had already arrived is still useful to the caller.
fn render_partial(stdout_lines: &[String], stderr_lines: &[String]) -> String {
    render_output(stdout_lines, stderr_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbx_process::SymbolServerEnv;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_fake_debugger_script() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("fake_cdb.sh");
        let mut file = std::fs::File::create(&script_path).expect("create script");
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo 'Microsoft (R) Windows Debugger'").unwrap();
        writeln!(file, "while IFS= read -r line; do").unwrap();
        writeln!(file, "  if [ \"$line\" = \"q\" ]; then exit 0; fi").unwrap();
        writeln!(file, "  # split on '; ' and echo each segment's payload").unwrap();
        writeln!(file, "  echo \"$line\" | tr ';' '\\n' | while IFS= read -r part; do").unwrap();
        writeln!(file, "    part=$(echo \"$part\" | sed 's/^ *//;s/ *$//')").unwrap();
        writeln!(
            file,
            "    case \"$part\" in .echo\\ *) echo \"${{part#.echo }}\" ;; *) echo \"$part\" ;; esac"
        )
        .unwrap();
        writeln!(file, "  done").unwrap();
        writeln!(file, "done").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        (dir, script_path)
    }

    async fn start_executor() -> (
        Arc<TokioMutex<ProcessManager>>,
        CommandExecutor,
        tempfile::TempDir,
    ) {
        let (dir, script) = write_fake_debugger_script();
        let mut manager = ProcessManager::new();
        let (_outcome, stdout_rx, stderr_rx) = manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("start succeeds");
        let process = Arc::new(TokioMutex::new(manager));
        let executor = CommandExecutor::new(
            process.clone(),
            stdout_rx,
            stderr_rx,
            CancellationToken::new(),
        );
        (process, executor, dir)
    }

    fn generous_timeouts(command_timeout: Duration) -> ExecutionTimeouts {
        ExecutionTimeouts {
            command_timeout,
            idle_timeout: Duration::from_secs(5),
            output_read_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn executes_a_single_command_and_returns_payload() {
        let (process, executor, _dir) = start_executor().await;
        let result = executor
            .execute(
                "cmd-1",
                "version",
                generous_timeouts(Duration::from_secs(5)),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_success, "{:?}", result.error_message);
        assert!(result.output_text.contains("version"));
        process.lock().await.stop().await;
    }

    #[tokio::test]
    async fn timeout_fails_the_command() {
        let (process, executor, _dir) = start_executor().await;
        let result = executor
            .execute(
                "cmd-2",
                "version",
                generous_timeouts(Duration::from_millis(1)),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_success);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap_or_default()
                .contains("timed out")
        );
        process.lock().await.stop().await;
    }

    #[tokio::test]
    async fn idle_silence_fails_the_command() {
        let (process, executor, _dir) = start_executor().await;
        let result = executor
            .execute(
                "cmd-idle",
                "version",
                ExecutionTimeouts {
                    command_timeout: Duration::from_secs(5),
                    idle_timeout: Duration::from_millis(1),
                    output_read_timeout: Duration::from_millis(50),
                },
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_success);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap_or_default()
                .contains("silence")
        );
        process.lock().await.stop().await;
    }

    #[tokio::test]
    async fn external_cancellation_fails_the_command() {
        let (process, executor, _dir) = start_executor().await;
        let token = CancellationToken::new();
        token.cancel();
        let result = executor
            .execute(
                "cmd-3",
                "version",
                generous_timeouts(Duration::from_secs(5)),
                token,
            )
            .await;
        assert!(!result.is_success);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap_or_default()
                .contains("cancelled")
        );
        process.lock().await.stop().await;
    }
}

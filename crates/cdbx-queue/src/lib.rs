//! The externally visible façade: a FIFO command queue with a tracker, a
//! single background processor task, and pass-through result retrieval
//! backed by `cdbx-cache` (spec §4.7).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use cdbx_cache::ResultCache;
use cdbx_core::{CommandResult, CommandState, NotificationSink, SupervisorError, new_command_id};
use cdbx_executor::{CommandExecutor, ExecutionTimeouts};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returned by [`CommandQueue::get_result`] while the command is still
/// `Queued` or `Executing`.
pub const STILL_EXECUTING_SENTINEL: &str = "<<command still executing>>";
/// Returned by [`CommandQueue::get_result`] for an id the tracker has never
/// seen (or has since pruned via [`CommandQueue::trigger_cleanup`]).
pub const NOT_FOUND_SENTINEL: &str = "<<command not found>>";

struct TrackedCommand {
    text: String,
    state: CommandState,
    queued_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub id: String,
    pub state: CommandState,
    /// 0 = currently executing; 1..N = FIFO position among queued commands;
    /// -1 = not positioned (terminal or unknown).
    pub queue_position: i64,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub queued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
}

struct Shared {
    executor: Arc<CommandExecutor>,
    cache: Arc<ResultCache>,
    tracker: TokioMutex<HashMap<String, TrackedCommand>>,
    pending_order: TokioMutex<VecDeque<String>>,
    currently_executing: TokioMutex<Option<String>>,
    timeouts: ExecutionTimeouts,
    notification_sink: Arc<dyn NotificationSink>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    queued_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    cancelled_total: AtomicU64,
}

pub struct CommandQueue {
    shared: Arc<Shared>,
    dispatch_tx: TokioMutex<Option<mpsc::UnboundedSender<String>>>,
    retention: Duration,
    disposed: AtomicBool,
}

impl CommandQueue {
    pub fn new(
        executor: Arc<CommandExecutor>,
        cache: Arc<ResultCache>,
        timeouts: ExecutionTimeouts,
        retention: Duration,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            executor,
            cache,
            tracker: TokioMutex::new(HashMap::new()),
            pending_order: TokioMutex::new(VecDeque::new()),
            currently_executing: TokioMutex::new(None),
            timeouts,
            notification_sink,
            counters: Counters::default(),
        });

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_processor(shared.clone(), dispatch_rx));

        Self {
            shared,
            dispatch_tx: TokioMutex::new(Some(dispatch_tx)),
            retention,
            disposed: AtomicBool::new(false),
        }
    }

    /// Enqueue `command_text`, returning its id. Rejects empty/whitespace
    /// text and any submission after disposal.
    pub async fn submit(&self, command_text: &str) -> Result<String, SupervisorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SupervisorError::InvalidState("queue is disposed".into()));
        }
        if command_text.trim().is_empty() {
            return Err(SupervisorError::InvalidArgument(
                "command text must not be empty".into(),
            ));
        }

        let id = new_command_id();
        let tracked = TrackedCommand {
            text: command_text.to_string(),
            state: CommandState::Queued,
            queued_at: Utc::now(),
            completed_at: None,
            cancel: CancellationToken::new(),
        };

        self.shared.tracker.lock().await.insert(id.clone(), tracked);
        self.shared.pending_order.lock().await.push_back(id.clone());
        self.shared.counters.queued_total.fetch_add(1, Ordering::Relaxed);

        let guard = self.dispatch_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(id.clone());
        }

        Ok(id)
    }

    /// Render the current result text for `command_id`, or a stable
    /// sentinel string if it is still in flight or unknown.
    pub async fn get_result(&self, command_id: &str) -> String {
        if let Some(result) = self.shared.cache.get(command_id) {
            return render_result_text(&result);
        }

        let tracker = self.shared.tracker.lock().await;
        match tracker.get(command_id) {
            Some(tracked) if !tracked.state.is_terminal() => STILL_EXECUTING_SENTINEL.to_string(),
            Some(_) => NOT_FOUND_SENTINEL.to_string(),
            None => NOT_FOUND_SENTINEL.to_string(),
        }
    }

    /// True iff a tracked, non-terminal command with `command_id` had its
    /// cancellation handle triggered. False for unknown or empty ids.
    pub async fn cancel(&self, command_id: &str) -> bool {
        if command_id.trim().is_empty() {
            return false;
        }
        self.cancel_one(command_id, "cancelled by caller").await
    }

    /// Cancel every non-terminal tracked command, returning how many were
    /// actually transitioned.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = {
            let tracker = self.shared.tracker.lock().await;
            tracker
                .iter()
                .filter(|(_, t)| !t.state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut count = 0;
        for id in ids {
            if self.cancel_one(&id, reason).await {
                count += 1;
            }
        }
        count
    }

    async fn cancel_one(&self, command_id: &str, reason: &str) -> bool {
        let (was_queued, text) = {
            let mut tracker = self.shared.tracker.lock().await;
            let Some(entry) = tracker.get_mut(command_id) else {
                return false;
            };
            if entry.state.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            let was_queued = entry.state == CommandState::Queued;
            if was_queued {
                entry.state = CommandState::Cancelled;
                entry.completed_at = Some(Utc::now());
            }
            (was_queued, entry.text.clone())
        };

        if was_queued {
            self.shared
                .pending_order
                .lock()
                .await
                .retain(|id| id != command_id);
            self.shared
                .counters
                .cancelled_total
                .fetch_add(1, Ordering::Relaxed);
            let now = Utc::now();
            self.shared.cache.store(
                command_id,
                CommandResult::failure(
                    String::new(),
                    format!("command cancelled: {reason}"),
                    text,
                    now,
                    None,
                    now,
                ),
                HashMap::new(),
            );
            self.shared
                .notification_sink
                .on_command_completed(command_id, CommandState::Cancelled);
        }
        // Executing -> Cancelled is resolved by the processor once the
        // executor observes the cancellation token and returns.
        true
    }

    pub async fn status_snapshot(&self) -> Vec<CommandStatus> {
        let tracker = self.shared.tracker.lock().await;
        let pending = self.shared.pending_order.lock().await;
        let current = self.shared.currently_executing.lock().await.clone();

        tracker
            .iter()
            .map(|(id, tracked)| {
                let queue_position = if Some(id) == current.as_ref() {
                    0
                } else if let Some(index) = pending.iter().position(|p| p == id) {
                    (index as i64) + 1
                } else {
                    -1
                };
                CommandStatus {
                    id: id.clone(),
                    state: tracked.state,
                    queue_position,
                }
            })
            .collect()
    }

    /// Prune terminal tracker entries older than `retention`. Errors if the
    /// queue is disposed.
    pub async fn trigger_cleanup(&self) -> Result<(), SupervisorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SupervisorError::InvalidState("queue is disposed".into()));
        }
        let now = Utc::now();
        let retention = self.retention;
        let mut tracker = self.shared.tracker.lock().await;
        tracker.retain(|_, tracked| match tracked.completed_at {
            Some(completed_at) => {
                let elapsed = (now - completed_at).to_std().unwrap_or(Duration::ZERO);
                elapsed < retention
            }
            None => true,
        });
        Ok(())
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            queued_total: self.shared.counters.queued_total.load(Ordering::Relaxed),
            completed_total: self.shared.counters.completed_total.load(Ordering::Relaxed),
            failed_total: self.shared.counters.failed_total.load(Ordering::Relaxed),
            cancelled_total: self.shared.counters.cancelled_total.load(Ordering::Relaxed),
        }
    }

    /// Stop the processor task, cancel every outstanding command with a
    /// "disposed" reason, and dispose the backing cache.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.cancel_all("disposed").await;
        self.dispatch_tx.lock().await.take();
        self.shared.cache.dispose();
    }
}

fn render_result_text(result: &CommandResult) -> String {
    let mut text = result.output_text.clone();
    if let Some(error) = &result.error_message {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(error);
    }
    text
}

async fn run_processor(shared: Arc<Shared>, mut dispatch_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = dispatch_rx.recv().await {
        {
            let mut pending = shared.pending_order.lock().await;
            if pending.front().is_some_and(|front| front == &id) {
                pending.pop_front();
            } else {
                pending.retain(|p| p != &id);
            }
        }

        let dispatch = {
            let tracker = shared.tracker.lock().await;
            tracker
                .get(&id)
                .map(|t| (t.text.clone(), t.cancel.clone(), t.state))
        };
        let Some((text, cancel, state)) = dispatch else {
            continue;
        };
        if state.is_terminal() {
            continue;
        }

        if shared.executor.is_drained() {
            finalize(&shared, &id, CommandResult::failure(
                String::new(),
                "session terminated".to_string(),
                text,
                Utc::now(),
                None,
                Utc::now(),
            ), CommandState::Failed)
            .await;
            continue;
        }

        *shared.currently_executing.lock().await = Some(id.clone());
        if let Some(entry) = shared.tracker.lock().await.get_mut(&id) {
            entry.state = CommandState::Executing;
        }

        let result = shared
            .executor
            .execute(&id, &text, shared.timeouts, cancel.clone())
            .await;

        *shared.currently_executing.lock().await = None;

        let final_state = if cancel.is_cancelled() {
            CommandState::Cancelled
        } else if result.is_success {
            CommandState::Completed
        } else {
            CommandState::Failed
        };

        finalize(&shared, &id, result, final_state).await;
    }
    info!("command queue processor loop exited");
}

async fn finalize(shared: &Arc<Shared>, id: &str, result: CommandResult, state: CommandState) {
    if let Some(entry) = shared.tracker.lock().await.get_mut(id) {
        entry.state = state;
        entry.completed_at = Some(Utc::now());
    } else {
        warn!(id, "finalizing a command no longer present in the tracker");
    }
    match state {
        CommandState::Completed => shared.counters.completed_total.fetch_add(1, Ordering::Relaxed),
        CommandState::Cancelled => shared.counters.cancelled_total.fetch_add(1, Ordering::Relaxed),
        _ => shared.counters.failed_total.fetch_add(1, Ordering::Relaxed),
    };
    shared.cache.store(id, result, HashMap::new());
    shared.notification_sink.on_command_completed(id, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdbx_process::{ProcessManager, SymbolServerEnv};
    use std::io::Write;
    use std::path::PathBuf;

    fn write_fake_debugger_script() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("fake_cdb.sh");
        let mut file = std::fs::File::create(&script_path).expect("create script");
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo 'banner'").unwrap();
        writeln!(file, "while IFS= read -r line; do").unwrap();
        writeln!(file, "  if [ \"$line\" = \"q\" ]; then exit 0; fi").unwrap();
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

    async fn make_queue() -> (CommandQueue, tempfile::TempDir) {
        let (dir, script) = write_fake_debugger_script();
        let mut manager = ProcessManager::new();
        let (_outcome, stdout_rx, stderr_rx) = manager
            .start(&[], Some(&script), None, &SymbolServerEnv::default(), Duration::ZERO)
            .await
            .expect("start succeeds");
        let process = Arc::new(TokioMutex::new(manager));
        let executor = Arc::new(CommandExecutor::new(
            process,
            stdout_rx,
            stderr_rx,
            CancellationToken::new(),
        ));
        let cache = Arc::new(ResultCache::new(cdbx_cache::CacheBounds::default()));
        let queue = CommandQueue::new(
            executor,
            cache,
            ExecutionTimeouts {
                command_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(5),
                output_read_timeout: Duration::from_millis(50),
            },
            Duration::from_secs(3600),
            Arc::new(cdbx_core::NullNotificationSink),
        );
        (queue, dir)
    }

    #[tokio::test]
    async fn submit_then_poll_eventually_completes() {
        let (queue, _dir) = make_queue().await;
        let id = queue.submit("version").await.expect("submitted");

        let mut text = queue.get_result(&id).await;
        for _ in 0..50 {
            if text != STILL_EXECUTING_SENTINEL {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            text = queue.get_result(&id).await;
        }
        assert!(text.contains("version"), "got: {text}");
    }

    #[tokio::test]
    async fn unknown_id_returns_not_found_sentinel() {
        let (queue, _dir) = make_queue().await;
        assert_eq!(queue.get_result("nonexistent").await, NOT_FOUND_SENTINEL);
    }

    #[tokio::test]
    async fn empty_command_text_is_rejected() {
        let (queue, _dir) = make_queue().await;
        let err = queue.submit("   ").await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cancel_unknown_id_returns_false() {
        let (queue, _dir) = make_queue().await;
        assert!(!queue.cancel("nonexistent").await);
        assert!(!queue.cancel("").await);
    }

    #[tokio::test]
    async fn disposal_rejects_further_submissions() {
        let (queue, _dir) = make_queue().await;
        queue.dispose().await;
        let err = queue.submit("version").await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidState(_)));
    }
}

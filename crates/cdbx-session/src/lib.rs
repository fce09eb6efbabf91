//! Composition root: wires `ProcessManager`, the stream pumps,
//! `CommandExecutor`, `CommandQueue`, and `ResultCache` into one
//! externally-usable handle (spec §4.8).

use std::path::PathBuf;
use std::sync::Arc;

use cdbx_cache::{CacheBounds, MemoryPressureProvider, ProcessMemoryProvider, ResultCache};
use cdbx_core::{NotificationSink, NullNotificationSink, SessionConfig};
use cdbx_executor::{CommandExecutor, ExecutionTimeouts};
use cdbx_process::{ProcessManager, SymbolServerEnv};
use cdbx_queue::{CommandQueue, CommandStatus, QueueCounters};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Rewrites command text before it reaches the executor (e.g. path
/// rewriting). Out of scope to implement any real rewriting rule here
/// (spec §1) — this is purely the collaborator contract.
pub trait CommandPreprocessor: Send + Sync {
    fn preprocess(&self, command_text: &str) -> String;
}

struct Running {
    process: Arc<TokioMutex<ProcessManager>>,
    executor: Arc<CommandExecutor>,
    queue: Arc<CommandQueue>,
}

/// Owns every other component exclusively; `Session` is the only public
/// entry point an embedder needs.
pub struct Session {
    config: SessionConfig,
    running: TokioMutex<Option<Running>>,
    preprocessor: Option<Box<dyn CommandPreprocessor>>,
    notification_sink: Arc<dyn NotificationSink>,
    memory_pressure: Option<Arc<dyn MemoryPressureProvider>>,
    process_memory: Option<Arc<dyn ProcessMemoryProvider>>,
    cache_bounds: CacheBounds,
    session_cancel: CancellationToken,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Start the child debugger if not already running. Idempotent: a
    /// second call while active returns `true` without restarting.
    pub async fn start(&self, target_args: &[String]) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return true;
        }

        let mut manager = ProcessManager::new();
        let symbol_env = SymbolServerEnv {
            retries: Some(self.config.symbol_server_retries),
            timeout_secs: None,
            search_path: self.config.symbol_search_path.clone(),
        };
        let start_result = manager
            .start(
                target_args,
                self.config.executable_path_override.as_deref(),
                None,
                &symbol_env,
                self.config.startup_delay,
            )
            .await;

        let (_, stdout_rx, stderr_rx) = match start_result {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "failed to start debugger child process");
                return false;
            }
        };

        let process = Arc::new(TokioMutex::new(manager));
        let executor = Arc::new(CommandExecutor::new(
            process.clone(),
            stdout_rx,
            stderr_rx,
            self.session_cancel.clone(),
        ));
        let cache = Arc::new(self.build_cache());
        let queue = Arc::new(CommandQueue::new(
            executor.clone(),
            cache,
            ExecutionTimeouts {
                command_timeout: self.config.command_timeout,
                idle_timeout: self.config.idle_timeout,
                output_read_timeout: self.config.output_read_timeout,
            },
            std::time::Duration::from_secs(3600),
            self.notification_sink.clone(),
        ));

        *running = Some(Running {
            process,
            executor,
            queue,
        });
        true
    }

    fn build_cache(&self) -> ResultCache {
        match (&self.memory_pressure, &self.process_memory) {
            (Some(memory_pressure), Some(process_memory)) => ResultCache::with_pressure_providers(
                self.cache_bounds,
                memory_pressure.clone(),
                process_memory.clone(),
            ),
            _ => ResultCache::new(self.cache_bounds),
        }
    }

    /// Graceful-then-forced shutdown of the child and its components.
    /// Idempotent: a second call after the process has exited returns
    /// `true`.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return true;
        };
        running.queue.dispose().await;
        running.process.lock().await.stop().await
    }

    /// True iff the child process is running and ready for commands.
    pub async fn is_active(&self) -> bool {
        match self.running.lock().await.as_ref() {
            Some(running) => running.process.lock().await.is_active(),
            None => false,
        }
    }

    /// Apply the configured preprocessor (if any) and submit to the queue.
    pub async fn submit(&self, command_text: &str) -> Result<String, SessionError> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(SessionError::NotStarted);
        };

        let processed = match &self.preprocessor {
            Some(preprocessor) => preprocessor.preprocess(command_text),
            None => {
                if self.config.command_preprocessing_enabled {
                    warn!("command preprocessing is enabled but no preprocessor is configured");
                }
                command_text.to_string()
            }
        };

        running
            .queue
            .submit(&processed)
            .await
            .map_err(SessionError::Supervisor)
    }

    pub async fn get_result(&self, command_id: &str) -> Result<String, SessionError> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(SessionError::NotStarted);
        };
        Ok(running.queue.get_result(command_id).await)
    }

    pub async fn cancel(&self, command_id: &str) -> bool {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.queue.cancel(command_id).await,
            None => false,
        }
    }

    pub async fn cancel_all(&self, reason: &str) -> usize {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.queue.cancel_all(reason).await,
            None => 0,
        }
    }

    pub async fn status_snapshot(&self) -> Vec<CommandStatus> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.queue.status_snapshot().await,
            None => Vec::new(),
        }
    }

    pub async fn counters(&self) -> QueueCounters {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.queue.counters(),
            None => QueueCounters::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has not been started")]
    NotStarted,
    #[error(transparent)]
    Supervisor(#[from] cdbx_core::SupervisorError),
}

pub struct SessionBuilder {
    config: SessionConfig,
    preprocessor: Option<Box<dyn CommandPreprocessor>>,
    notification_sink: Option<Arc<dyn NotificationSink>>,
    memory_pressure: Option<Arc<dyn MemoryPressureProvider>>,
    process_memory: Option<Arc<dyn ProcessMemoryProvider>>,
    cache_bounds: CacheBounds,
}

impl SessionBuilder {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            preprocessor: None,
            notification_sink: None,
            memory_pressure: None,
            process_memory: None,
            cache_bounds: CacheBounds::default(),
        }
    }

    pub fn preprocessor(mut self, preprocessor: Box<dyn CommandPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = Some(sink);
        self
    }

    pub fn memory_pressure_provider(mut self, provider: Arc<dyn MemoryPressureProvider>) -> Self {
        self.memory_pressure = Some(provider);
        self
    }

    pub fn process_memory_provider(mut self, provider: Arc<dyn ProcessMemoryProvider>) -> Self {
        self.process_memory = Some(provider);
        self
    }

    pub fn cache_bounds(mut self, bounds: CacheBounds) -> Self {
        self.cache_bounds = bounds;
        self
    }

    pub fn build(self) -> Session {
        Session {
            config: self.config,
            running: TokioMutex::new(None),
            preprocessor: self.preprocessor,
            notification_sink: self
                .notification_sink
                .unwrap_or_else(|| Arc::new(NullNotificationSink)),
            memory_pressure: self.memory_pressure,
            process_memory: self.process_memory,
            cache_bounds: self.cache_bounds,
            session_cancel: CancellationToken::new(),
        }
    }
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

    #[tokio::test]
    async fn start_is_idempotent_and_reports_active() {
        let (_dir, script) = write_fake_debugger_script();
        let config = SessionConfig::builder()
            .executable_path_override(script)
            .build()
            .expect("valid config");
        let session = Session::builder(config).build();

        assert!(session.start(&[]).await);
        assert!(session.start(&[]).await);
        assert!(session.is_active().await);

        assert!(session.stop().await);
        assert!(session.stop().await);
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let config = SessionConfig::builder().build().expect("valid config");
        let session = Session::builder(config).build();
        let err = session.submit("version").await.unwrap_err();
        assert!(matches!(err, SessionError::NotStarted));
    }

    #[tokio::test]
    async fn end_to_end_submit_and_get_result() {
        let (_dir, script) = write_fake_debugger_script();
        let config = SessionConfig::builder()
            .executable_path_override(script)
            .build()
            .expect("valid config");
        let session = Session::builder(config).build();
        assert!(session.start(&[]).await);

        let id = session.submit("version").await.expect("submitted");
        let mut text = session.get_result(&id).await.expect("has result");
        for _ in 0..50 {
            if text != cdbx_queue::STILL_EXECUTING_SENTINEL {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            text = session.get_result(&id).await.expect("has result");
        }
        assert!(text.contains("version"), "got: {text}");

        session.stop().await;
    }
}

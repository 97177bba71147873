//! Build orchestration: identifier issuance, status tracking, worker
//! supervision and event fan-out
//!
//! The registry is an explicitly constructed context object; create as many
//! independent instances as needed (one per test, one per IDE window).
//! `start` validates the request, inserts the entry and returns the new
//! `BuildId` immediately; a dedicated worker thread drives the executor and
//! callers observe the build via `status`, `wait`, per-build callbacks or
//! the `subscribe` event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::error::BuildError;
use crate::executor::{self, CancelToken, EventSink, ExecutionContext, ExecutionOutput};
use crate::planner::{DEFAULT_TOOLCHAIN, MANIFEST_FILENAME};
use crate::types::{
    BuildConfig, BuildDiagnostic, BuildEvent, BuildId, BuildProgress, BuildState, BuildStatus,
    BuildTarget, DiagnosticSeverity, LogEntry, LogLevel, ProjectRef, now_ms,
};

pub type ProgressCallback = Arc<dyn Fn(&BuildProgress) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Completion signal a caller can block on in `wait`
type FinishedSignal = Arc<(Mutex<bool>, Condvar)>;

/// One in-flight or retained build
struct BuildEntry {
    id: BuildId,
    config: BuildConfig,
    status: BuildStatus,
    on_progress: Option<ProgressCallback>,
    on_log: Option<LogCallback>,
    cancel: Arc<CancelToken>,
    finished: FinishedSignal,
}

struct RegistryInner {
    toolchain: String,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, BuildEntry>>,
    subscribers: Mutex<Vec<Sender<BuildEvent>>>,
}

/// Orchestrator owning build identity, status and callback wiring
pub struct BuildRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::with_toolchain(DEFAULT_TOOLCHAIN)
    }

    /// Use a different toolchain binary (absolute path or `$PATH` name)
    pub fn with_toolchain(toolchain: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                toolchain: toolchain.into(),
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start a build and return its identifier immediately.
    ///
    /// Validation happens before any entry is inserted: a failed `start`
    /// never allocates an id retrievable through `status` and leaves
    /// `total_count` unchanged.
    pub fn start(
        &self,
        project: &ProjectRef,
        target: BuildTarget,
        config: BuildConfig,
    ) -> Result<BuildId, BuildError> {
        self.start_with_callbacks(project, target, config, None, None)
    }

    /// Same as `start`, registering per-build callbacks before the worker
    /// emits its first checkpoint
    pub fn start_with_callbacks(
        &self,
        project: &ProjectRef,
        target: BuildTarget,
        config: BuildConfig,
        on_progress: Option<ProgressCallback>,
        on_log: Option<LogCallback>,
    ) -> Result<BuildId, BuildError> {
        if project.name.trim().is_empty() {
            return Err(BuildError::InvalidProject(
                "project name is empty".to_string(),
            ));
        }
        let manifest = project.path.join(MANIFEST_FILENAME);
        if !manifest.is_file() {
            return Err(BuildError::InvalidProjectPath { path: manifest });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let build_id = BuildId {
            id,
            project: project.name.clone(),
            target,
            started_at: now_ms(),
        };
        let cancel = Arc::new(CancelToken::default());
        let finished: FinishedSignal = Arc::new((Mutex::new(false), Condvar::new()));

        {
            let mut entries = self.inner.entries.lock();
            entries.insert(
                id,
                BuildEntry {
                    id: build_id.clone(),
                    config: config.clone(),
                    status: BuildStatus::default(),
                    on_progress,
                    on_log,
                    cancel: cancel.clone(),
                    finished: finished.clone(),
                },
            );
        }
        tracing::info!(
            build_id = id,
            project = %project.name,
            target = %target,
            "build started"
        );

        let inner = self.inner.clone();
        let project_path = project.path.clone();
        let spawned = thread::Builder::new()
            .name(format!("build-{id}"))
            .spawn(move || {
                let sink = RegistrySink {
                    inner: inner.clone(),
                    build_id: id,
                };
                let ctx = ExecutionContext {
                    toolchain: &inner.toolchain,
                    project_path: &project_path,
                    target,
                    config: &config,
                    cancel,
                };
                let result = executor::execute(&ctx, &sink);
                inner.finalize(id, result);
            });

        if let Err(source) = spawned {
            // Worker never ran; withdraw the entry so the id is not
            // observable in a permanently pending state.
            self.inner.entries.lock().remove(&id);
            return Err(BuildError::ProcessSpawnFailed { source });
        }
        Ok(build_id)
    }

    /// Request cancellation of a running build.
    ///
    /// Fire-and-forget: the worker kills and reaps the child, then
    /// transitions the entry to `cancelled`. A no-op on unknown ids and on
    /// entries already in a terminal state.
    pub fn cancel(&self, id: u64) {
        let entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(&id) {
            if !entry.status.state.is_finished() {
                tracing::info!(build_id = id, "cancellation requested");
                entry.cancel.cancel();
            }
        }
    }

    /// Copy of the configuration a build was started with
    pub fn config(&self, id: u64) -> Option<BuildConfig> {
        self.inner
            .entries
            .lock()
            .get(&id)
            .map(|entry| entry.config.clone())
    }

    /// Copy of the current status; `None` for ids this registry never issued
    pub fn status(&self, id: u64) -> Option<BuildStatus> {
        self.inner
            .entries
            .lock()
            .get(&id)
            .map(|entry| entry.status.clone())
    }

    /// Block until the build reaches a terminal state, then return its
    /// final status. `None` for unknown ids.
    pub fn wait(&self, id: u64) -> Option<BuildStatus> {
        let finished = {
            let entries = self.inner.entries.lock();
            entries.get(&id)?.finished.clone()
        };
        let (done, condvar) = &*finished;
        let mut done = done.lock();
        while !*done {
            condvar.wait(&mut done);
        }
        drop(done);
        self.status(id)
    }

    /// Replace the progress callback of an entry
    pub fn set_progress_callback(&self, id: u64, callback: ProgressCallback) {
        if let Some(entry) = self.inner.entries.lock().get_mut(&id) {
            entry.on_progress = Some(callback);
        }
    }

    /// Replace the log callback of an entry
    pub fn set_log_callback(&self, id: u64, callback: LogCallback) {
        if let Some(entry) = self.inner.entries.lock().get_mut(&id) {
            entry.on_log = Some(callback);
        }
    }

    /// Subscribe to all build events of this registry. Per-build ordering
    /// follows execution order; cross-build ordering is unspecified.
    pub fn subscribe(&self) -> Receiver<BuildEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Record a state transition and fan it out; used by the executor sink
    /// and available to external drivers of reserved states
    pub fn update_progress(&self, id: u64, state: BuildState, progress: f32, step: Option<&str>) {
        self.inner.progress(id, state, progress, step);
    }

    /// Fan a log line out to the entry's callback and all subscribers.
    /// The message is not persisted.
    pub fn emit_log(&self, id: u64, level: LogLevel, message: &str) {
        self.inner.log(id, level, message, None);
    }

    /// Number of entries not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| !entry.status.state.is_finished())
            .count()
    }

    /// Number of retained entries, finished ones included
    pub fn total_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Evict the oldest finished entries beyond `max_retained`, returning
    /// how many were dropped. In-flight entries are never evicted.
    pub fn evict_finished(&self, max_retained: usize) -> usize {
        let mut entries = self.inner.entries.lock();
        let mut finished: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.status.state.is_finished())
            .map(|(id, _)| *id)
            .collect();
        if finished.len() <= max_retained {
            return 0;
        }
        finished.sort_unstable();
        let evicted = finished.len() - max_retained;
        for id in finished.into_iter().take(evicted) {
            entries.remove(&id);
        }
        tracing::debug!(evicted, "evicted finished builds");
        evicted
    }
}

impl RegistryInner {
    /// Mutate stored status and dispatch the progress event. The entry lock
    /// is released before any callback runs.
    fn progress(&self, build_id: u64, state: BuildState, progress: f32, step: Option<&str>) {
        let (event, callback) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&build_id) else {
                return;
            };
            entry.status.state = state;
            entry.status.progress = progress;
            entry.status.current_step = step.map(str::to_string);
            entry.status.elapsed_ms = (now_ms() - entry.id.started_at).max(0) as u64;
            (
                BuildProgress {
                    build_id,
                    state,
                    progress,
                    message: step.map(str::to_string),
                    timestamp: now_ms(),
                },
                entry.on_progress.clone(),
            )
        };
        if let Some(callback) = callback {
            callback(&event);
        }
        self.broadcast(BuildEvent::Progress(event));
    }

    fn log(
        &self,
        build_id: u64,
        level: LogLevel,
        message: &str,
        diagnostic: Option<&BuildDiagnostic>,
    ) {
        let (event, callback) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&build_id) else {
                return;
            };
            if let Some(diag) = diagnostic {
                match diag.severity {
                    DiagnosticSeverity::Error => entry.status.errors += 1,
                    DiagnosticSeverity::Warning => entry.status.warnings += 1,
                    DiagnosticSeverity::Note => {}
                }
            }
            (
                LogEntry {
                    build_id,
                    level,
                    message: message.to_string(),
                    file: diagnostic.and_then(|d| d.file.clone()),
                    line: diagnostic.and_then(|d| d.line),
                    column: diagnostic.and_then(|d| d.column),
                    timestamp: now_ms(),
                },
                entry.on_log.clone(),
            )
        };
        if let Some(callback) = callback {
            callback(&event);
        }
        self.broadcast(BuildEvent::Log(event));
    }

    fn compile_progress(&self, build_id: u64, files_compiled: u32, files_total: u32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&build_id) {
            entry.status.files_compiled = files_compiled;
            entry.status.files_total = files_total;
        }
    }

    fn broadcast(&self, event: BuildEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Apply the execution result to the stored entry and release waiters.
    /// The executor already emitted the terminal progress event; this only
    /// reconciles the stored status.
    fn finalize(&self, build_id: u64, result: Result<ExecutionOutput, BuildError>) {
        let finished = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&build_id) else {
                return;
            };
            match &result {
                Ok(output) => {
                    entry.status.state = BuildState::Completed;
                    entry.status.progress = 1.0;
                    entry.status.elapsed_ms = output.duration_ms;
                    tracing::info!(
                        build_id,
                        duration_ms = output.duration_ms,
                        output_path = ?output.output_path,
                        "build completed"
                    );
                }
                Err(BuildError::Cancelled) => {
                    entry.status.state = BuildState::Cancelled;
                    entry.status.elapsed_ms = (now_ms() - entry.id.started_at).max(0) as u64;
                    tracing::info!(build_id, "build cancelled");
                }
                Err(err) => {
                    entry.status.state = BuildState::Failed;
                    entry.status.elapsed_ms = (now_ms() - entry.id.started_at).max(0) as u64;
                    tracing::warn!(build_id, error = %err, "build failed");
                }
            }
            entry.finished.clone()
        };
        let (done, condvar) = &*finished;
        *done.lock() = true;
        condvar.notify_all();
    }
}

/// Executor-facing sink bound to one build id
struct RegistrySink {
    inner: Arc<RegistryInner>,
    build_id: u64,
}

impl EventSink for RegistrySink {
    fn progress(&self, state: BuildState, progress: f32, step: Option<&str>) {
        self.inner.progress(self.build_id, state, progress, step);
    }

    fn log(&self, level: LogLevel, message: &str, diagnostic: Option<&BuildDiagnostic>) {
        self.inner.log(self.build_id, level, message, diagnostic);
    }

    fn compile_progress(&self, files_compiled: u32, files_total: u32) {
        self.inner
            .compile_progress(self.build_id, files_compiled, files_total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_rejects_empty_project_name() {
        let registry = BuildRegistry::new();
        let project = ProjectRef::new("", std::env::temp_dir());
        let err = registry
            .start(&project, BuildTarget::Web, BuildConfig::default())
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidProject(_)));
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_start_rejects_missing_manifest_without_allocating_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BuildRegistry::new();
        let project = ProjectRef::new("demo", dir.path());

        let err = registry
            .start(&project, BuildTarget::Web, BuildConfig::default())
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidProjectPath { .. }));
        assert_eq!(registry.total_count(), 0);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.status(1).is_none());
    }

    #[test]
    fn test_status_of_unknown_id_is_none() {
        let registry = BuildRegistry::new();
        assert!(registry.status(42).is_none());
        assert!(registry.wait(42).is_none());
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let registry = BuildRegistry::new();
        registry.cancel(7);
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_evict_on_empty_registry() {
        let registry = BuildRegistry::new();
        assert_eq!(registry.evict_finished(0), 0);
    }
}

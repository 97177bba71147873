//! Child-process execution and supervision for a single build

use std::io::{self, BufRead, BufReader};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::diagnostics::{parse_compile_progress, parse_diagnostic};
use crate::error::BuildError;
use crate::planner::{self, MANIFEST_FILENAME};
use crate::types::{
    BuildConfig, BuildDiagnostic, BuildState, BuildTarget, DiagnosticSeverity, LogLevel,
};

/// Longest command line echoed to the log; anything beyond is cut off and
/// the message marked as truncated. Lossy on purpose.
const COMMAND_LOG_CAP: usize = 2048;

/// Most stderr bytes retained for the post-exit warning line; excess is
/// dropped, not streamed
const STDERR_CAP: usize = 16 * 1024;

/// Interval of the supervision poll loop
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Cancellation token shared between a registry entry and its worker
#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicBool,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/// Everything the executor needs to run one build
pub struct ExecutionContext<'a> {
    pub toolchain: &'a str,
    pub project_path: &'a Path,
    pub target: BuildTarget,
    pub config: &'a BuildConfig,
    pub cancel: Arc<CancelToken>,
}

/// Successful execution outcome
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    /// Wall-clock duration measured by the executor
    pub duration_ms: u64,
    pub output_path: Option<PathBuf>,
    pub diagnostics: Vec<BuildDiagnostic>,
}

/// Sink for executor checkpoints. The registry implements this to update
/// the stored status and fan events out to callbacks and subscribers.
pub trait EventSink: Sync {
    fn progress(&self, state: BuildState, progress: f32, step: Option<&str>);
    fn log(&self, level: LogLevel, message: &str, diagnostic: Option<&BuildDiagnostic>);
    fn compile_progress(&self, _files_compiled: u32, _files_total: u32) {}
}

enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
    WaitFailed(io::Error),
}

/// Plan and run one toolchain invocation, blocking until the child exits,
/// is cancelled, or hits the configured deadline.
///
/// Checkpoints are emitted in a fixed order: `preparing` (5%), `compiling`
/// (20%), `linking` (60%, a coarse estimate since only the final exit
/// status is observable), then a terminal `completed`/`failed`/`cancelled`.
pub fn execute(ctx: &ExecutionContext, sink: &dyn EventSink) -> Result<ExecutionOutput, BuildError> {
    let start = Instant::now();
    sink.progress(BuildState::Preparing, 0.05, Some("preparing"));

    let plan = planner::plan(ctx.toolchain, ctx.project_path, ctx.target, ctx.config);
    sink.log(
        LogLevel::Info,
        &format!("$ {}", truncate_for_log(plan.command_line(), COMMAND_LOG_CAP)),
        None,
    );

    let manifest = ctx.project_path.join(MANIFEST_FILENAME);
    if !manifest.is_file() {
        sink.log(
            LogLevel::Error,
            &format!("build manifest not found at {}", manifest.display()),
            None,
        );
        return Err(BuildError::InvalidProjectPath { path: manifest });
    }

    sink.progress(BuildState::Compiling, 0.20, Some("compiling"));

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(ctx.project_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &ctx.config.env {
        cmd.env(key, value);
    }

    // The toolchain fans out compile workers that inherit the output
    // pipes; the child gets its own process group so the kill paths can
    // signal all of them, not just the direct child.
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            sink.log(
                LogLevel::Error,
                &format!("failed to spawn {}: {source}", plan.program),
                None,
            );
            sink.progress(BuildState::Failed, 0.0, Some("failed"));
            return Err(BuildError::ProcessSpawnFailed { source });
        }
    };
    tracing::debug!(
        program = %plan.program,
        project = %ctx.project_path.display(),
        "spawned build process"
    );

    sink.progress(BuildState::Linking, 0.60, Some("linking"));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (outcome, mut diagnostics, stderr_tail) = thread::scope(|s| {
        // Pipe handles are owned by these scoped readers; killing the child
        // closes the write ends and lets them drain and exit.
        let stdout_reader = stdout.map(|out| s.spawn(move || read_stdout(out, sink)));
        let stderr_reader = stderr.map(|err| s.spawn(move || read_stderr(err, sink)));

        let outcome = supervise(&mut child, ctx, start);

        let mut diagnostics = Vec::new();
        if let Some(handle) = stdout_reader {
            if let Ok(diags) = handle.join() {
                diagnostics = diags;
            }
        }
        let mut stderr_tail = String::new();
        if let Some(handle) = stderr_reader {
            if let Ok((tail, diags)) = handle.join() {
                stderr_tail = tail;
                diagnostics.extend(diags);
            }
        }
        (outcome, diagnostics, stderr_tail)
    });

    let duration_ms = start.elapsed().as_millis() as u64;

    // Non-diagnostic stderr surfaces as a warning line whether or not the
    // build succeeded; diagnostic lines were already streamed one by one.
    if !stderr_tail.trim().is_empty() {
        sink.log(LogLevel::Warning, stderr_tail.trim_end(), None);
    }

    match outcome {
        WaitOutcome::Exited(status) if status.success() => {
            sink.progress(BuildState::Completed, 1.0, Some("completed"));
            sink.log(
                LogLevel::Info,
                &format!("build completed in {duration_ms}ms"),
                None,
            );
            diagnostics.retain(|d| d.severity != DiagnosticSeverity::Note);
            Ok(ExecutionOutput {
                exit_code: 0,
                duration_ms,
                output_path: Some(plan.output_path),
                diagnostics,
            })
        }
        WaitOutcome::Exited(status) => {
            let exit_code = status.code();
            let message = match exit_code {
                Some(code) => format!("build failed with exit code {code}"),
                None => "build process terminated by signal".to_string(),
            };
            sink.log(LogLevel::Error, &message, None);
            sink.progress(BuildState::Failed, 0.0, Some("failed"));
            Err(BuildError::BuildFailed { exit_code })
        }
        WaitOutcome::Cancelled => {
            sink.log(LogLevel::Warning, "build cancelled; process terminated", None);
            sink.progress(BuildState::Cancelled, 0.0, Some("cancelled"));
            Err(BuildError::Cancelled)
        }
        WaitOutcome::TimedOut => {
            let timeout_ms = ctx.config.timeout_ms.unwrap_or_default();
            sink.log(
                LogLevel::Error,
                &format!("build timed out after {timeout_ms}ms; process terminated"),
                None,
            );
            sink.progress(BuildState::Failed, 0.0, Some("failed"));
            Err(BuildError::TimedOut { timeout_ms })
        }
        WaitOutcome::WaitFailed(err) => {
            sink.log(
                LogLevel::Error,
                &format!("failed to wait for build process: {err}"),
                None,
            );
            sink.progress(BuildState::Failed, 0.0, Some("failed"));
            Err(BuildError::BuildFailed { exit_code: None })
        }
    }
}

/// Poll the child until it exits, the cancel token fires, or the deadline
/// expires. The kill paths reap the child before returning so no zombie is
/// left behind.
fn supervise(child: &mut Child, ctx: &ExecutionContext, start: Instant) -> WaitOutcome {
    let deadline = ctx
        .config
        .timeout_ms
        .map(|ms| start + Duration::from_millis(ms));

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {}
            Err(err) => return WaitOutcome::WaitFailed(err),
        }

        if ctx.cancel.is_cancelled() {
            kill_and_reap(child);
            return WaitOutcome::Cancelled;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill_and_reap(child);
            return WaitOutcome::TimedOut;
        }

        thread::sleep(WAIT_POLL);
    }
}

/// Terminate the child's whole process group and reap the child. Killing
/// only the direct child would leave grandchildren holding the pipe write
/// ends open, stalling the readers until the entire tree exits.
#[cfg(unix)]
fn kill_and_reap(child: &mut Child) {
    let killed = unsafe { libc::killpg(child.id() as i32, libc::SIGKILL) };
    if killed != 0 {
        tracing::warn!(
            "failed to kill build process group: {}",
            io::Error::last_os_error()
        );
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::warn!("failed to kill build process: {err}");
    }
    let _ = child.wait();
}

/// Stream stdout line by line: info logs, `[n/total]` compile progress,
/// and inline diagnostics.
fn read_stdout(out: impl io::Read, sink: &dyn EventSink) -> Vec<BuildDiagnostic> {
    let reader = BufReader::new(out);
    let mut diagnostics = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some((compiled, total)) = parse_compile_progress(&line) {
            sink.compile_progress(compiled, total);
        }
        match parse_diagnostic(&line) {
            Some(diag) => {
                sink.log(level_for(diag.severity), &line, Some(&diag));
                diagnostics.push(diag);
            }
            None => sink.log(LogLevel::Info, &line, None),
        }
    }
    diagnostics
}

/// Capture stderr up to `STDERR_CAP` bytes and parse diagnostics from it.
/// Diagnostic lines are streamed as typed logs right away and kept out of
/// the tail, so each one surfaces exactly once.
fn read_stderr(err: impl io::Read, sink: &dyn EventSink) -> (String, Vec<BuildDiagnostic>) {
    let reader = BufReader::new(err);
    let mut tail = String::new();
    let mut diagnostics = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(diag) = parse_diagnostic(&line) {
            sink.log(level_for(diag.severity), &line, Some(&diag));
            diagnostics.push(diag);
        } else if tail.len() + line.len() < STDERR_CAP {
            tail.push_str(&line);
            tail.push('\n');
        }
    }
    (tail, diagnostics)
}

fn level_for(severity: DiagnosticSeverity) -> LogLevel {
    match severity {
        DiagnosticSeverity::Error => LogLevel::Error,
        DiagnosticSeverity::Warning => LogLevel::Warning,
        DiagnosticSeverity::Note => LogLevel::Debug,
    }
}

fn truncate_for_log(mut text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(" [truncated]");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        progress: Mutex<Vec<(BuildState, f32)>>,
        logs: Mutex<Vec<(LogLevel, String)>>,
    }

    impl EventSink for RecordingSink {
        fn progress(&self, state: BuildState, progress: f32, _step: Option<&str>) {
            self.progress.lock().push((state, progress));
        }

        fn log(&self, level: LogLevel, message: &str, _diagnostic: Option<&BuildDiagnostic>) {
            self.logs.lock().push((level, message.to_string()));
        }
    }

    fn context<'a>(
        toolchain: &'a str,
        project_path: &'a Path,
        config: &'a BuildConfig,
        cancel: &Arc<CancelToken>,
    ) -> ExecutionContext<'a> {
        ExecutionContext {
            toolchain,
            project_path,
            target: BuildTarget::Linux,
            config,
            cancel: cancel.clone(),
        }
    }

    #[test]
    fn test_missing_manifest_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let config = BuildConfig::default();
        let cancel = Arc::new(CancelToken::default());
        let ctx = context("definitely-not-a-real-binary", dir.path(), &config, &cancel);

        let err = execute(&ctx, &sink).unwrap_err();
        assert!(matches!(err, BuildError::InvalidProjectPath { .. }));

        // preparing was emitted, but nothing past the manifest check
        let progress = sink.progress.lock();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].0, BuildState::Preparing);
    }

    #[test]
    fn test_spawn_failure_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILENAME), "// manifest\n").unwrap();
        let sink = RecordingSink::default();
        let config = BuildConfig::default();
        let cancel = Arc::new(CancelToken::default());
        let ctx = context("definitely-not-a-real-binary", dir.path(), &config, &cancel);

        let err = execute(&ctx, &sink).unwrap_err();
        assert!(matches!(err, BuildError::ProcessSpawnFailed { .. }));
        let progress = sink.progress.lock();
        assert_eq!(progress.last().map(|p| p.0), Some(BuildState::Failed));
    }

    #[test]
    fn test_truncate_for_log() {
        let short = truncate_for_log("zig build".to_string(), 64);
        assert_eq!(short, "zig build");

        let long = truncate_for_log("x".repeat(100), 10);
        assert!(long.starts_with("xxxxxxxxxx"));
        assert!(long.ends_with("[truncated]"));
    }
}

//! Zylix Build Orchestration & Execution pipeline
//!
//! Turns a build request (project, target platform, configuration) into a
//! supervised `zig build` invocation and reports the lifecycle back:
//! - Command planning (argv and output-path convention, pure)
//! - Child-process execution with streamed output and structured
//!   diagnostics
//! - Progress/log delivery via per-build callbacks or a subscription
//!   stream
//! - Kill-based cancellation and optional deadlines
//! - An orchestrating registry issuing monotonically increasing build ids

mod diagnostics;
mod error;
mod executor;
mod planner;
mod registry;
mod types;

pub use diagnostics::{parse_compile_progress, parse_diagnostic};

pub use error::BuildError;

pub use executor::{
    CancelToken,
    EventSink,
    ExecutionContext,
    ExecutionOutput,
    execute,
};

pub use planner::{
    CommandPlan,
    DEFAULT_OUTPUT_DIR,
    DEFAULT_TOOLCHAIN,
    MANIFEST_FILENAME,
    plan,
};

pub use registry::{BuildRegistry, LogCallback, ProgressCallback};

pub use types::{
    BuildConfig,
    BuildDiagnostic,
    BuildEvent,
    BuildId,
    BuildMode,
    BuildProgress,
    BuildState,
    BuildStatus,
    BuildTarget,
    DiagnosticSeverity,
    LogEntry,
    LogLevel,
    OptLevel,
    ProjectRef,
};

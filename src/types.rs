//! Build pipeline types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Identity of the project a build request refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub name: String,
    pub path: PathBuf,
}

impl ProjectRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Target platform for a build
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildTarget {
    Ios,
    Android,
    Web,
    Macos,
    Windows,
    Linux,
    Embedded,
}

impl BuildTarget {
    /// Platform triple passed to the toolchain as `-Dtarget=`
    pub fn triple(&self) -> &'static str {
        match self {
            BuildTarget::Ios => "aarch64-macos",
            BuildTarget::Android => "aarch64-linux-android",
            BuildTarget::Web => "wasm32-freestanding",
            BuildTarget::Macos => "aarch64-macos",
            BuildTarget::Windows => "x86_64-windows",
            BuildTarget::Linux => "x86_64-linux",
            BuildTarget::Embedded => "thumb-freestanding",
        }
    }

    pub fn all() -> &'static [BuildTarget] {
        &[
            BuildTarget::Ios,
            BuildTarget::Android,
            BuildTarget::Web,
            BuildTarget::Macos,
            BuildTarget::Windows,
            BuildTarget::Linux,
            BuildTarget::Embedded,
        ]
    }
}

/// Build mode selecting the toolchain optimize profile
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildMode {
    #[default]
    Debug,
    Release,
    ReleaseSafe,
    ReleaseSmall,
}

impl BuildMode {
    /// Value passed to the toolchain as `-Doptimize=`
    pub fn optimize_flag(&self) -> &'static str {
        match self {
            BuildMode::Debug => "Debug",
            BuildMode::Release => "ReleaseFast",
            BuildMode::ReleaseSafe => "ReleaseSafe",
            BuildMode::ReleaseSmall => "ReleaseSmall",
        }
    }

    pub fn all() -> &'static [BuildMode] {
        &[
            BuildMode::Debug,
            BuildMode::Release,
            BuildMode::ReleaseSafe,
            BuildMode::ReleaseSmall,
        ]
    }
}

/// Requested optimization aggressiveness. Informational alongside the mode;
/// the mode alone decides the `-Doptimize` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    #[default]
    None,
    Size,
    Speed,
    Aggressive,
}

/// Per-build configuration, immutable for the lifetime of one build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub mode: BuildMode,
    pub optimization: OptLevel,
    /// Enable code signing
    pub sign: bool,
    pub signing_identity: Option<String>,
    /// Enable parallel compilation
    pub parallel: bool,
    /// Max parallel jobs (0 = toolchain auto-detect, no `-j` flag emitted)
    pub max_jobs: u8,
    pub incremental: bool,
    pub cache: bool,
    /// Passed to the toolchain verbatim, after all planned arguments
    pub extra_flags: Vec<String>,
    /// Merged over the process environment of the child
    pub env: Vec<(String, String)>,
    /// Overrides the `zig-out` output directory convention
    pub output_dir: Option<String>,
    /// Deadline for the whole invocation; on expiry the child is killed
    pub timeout_ms: Option<u64>,
}

/// Lifecycle state of a build
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildState {
    #[default]
    Pending,
    Preparing,
    Compiling,
    Linking,
    /// Reserved; valid but never emitted by the current executor
    Signing,
    /// Reserved; valid but never emitted by the current executor
    Packaging,
    Completed,
    Failed,
    Cancelled,
}

impl BuildState {
    /// Terminal states admit no further transitions
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BuildState::Completed | BuildState::Failed | BuildState::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildState::Completed)
    }
}

/// Identifier issued by the registry for one build request.
/// Immutable once issued; `id` is always greater than zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildId {
    pub id: u64,
    pub project: String,
    pub target: BuildTarget,
    /// Epoch milliseconds at issue time
    pub started_at: i64,
}

/// Point-in-time view of a build, owned and mutated by the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub state: BuildState,
    /// 0.0 - 1.0
    pub progress: f32,
    pub current_step: Option<String>,
    pub files_compiled: u32,
    pub files_total: u32,
    pub errors: u32,
    pub warnings: u32,
    pub elapsed_ms: u64,
}

/// Severity of a parsed toolchain diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Note,
}

/// Structured compiler diagnostic parsed from toolchain output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDiagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
}

/// Severity of a build log line
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Progress event delivered to callbacks and subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgress {
    pub build_id: u64,
    pub state: BuildState,
    /// 0.0 - 1.0
    pub progress: f32,
    pub message: Option<String>,
    pub timestamp: i64,
}

/// Log event delivered to callbacks and subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub build_id: u64,
    pub level: LogLevel,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub timestamp: i64,
}

/// Item of the registry-wide subscription stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildEvent {
    Progress(BuildProgress),
    Log(LogEntry),
}

/// Current timestamp in epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

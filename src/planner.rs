//! Pure command planning: build request to toolchain argv

use std::path::{Path, PathBuf};

use crate::types::{BuildConfig, BuildTarget};

/// Build manifest every Zylix project carries at its root
pub const MANIFEST_FILENAME: &str = "build.zig";

/// Toolchain binary used when the registry is not configured otherwise
pub const DEFAULT_TOOLCHAIN: &str = "zig";

/// Output directory convention used when the config carries no override
pub const DEFAULT_OUTPUT_DIR: &str = "zig-out";

/// A fully planned toolchain invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Where the toolchain places artifacts on success. Convention only;
    /// nothing exists at this path until the process exits 0.
    pub output_path: PathBuf,
}

impl CommandPlan {
    /// Full argv including the program itself
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Space-joined command line, for logging
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

/// Map a build request onto an ordered argument list and output path.
///
/// Deterministic and side-effect free. Argument order is fixed: base
/// command, `--build-file <manifest>`, `-Dtarget=`, `-Doptimize=`, an
/// optional `-j<N>` when `max_jobs > 0`, then the caller's extra flags
/// verbatim.
pub fn plan(
    toolchain: &str,
    project_path: &Path,
    target: BuildTarget,
    config: &BuildConfig,
) -> CommandPlan {
    let manifest = project_path.join(MANIFEST_FILENAME);

    let mut args = vec![
        "build".to_string(),
        "--build-file".to_string(),
        manifest.to_string_lossy().into_owned(),
        format!("-Dtarget={}", target.triple()),
        format!("-Doptimize={}", config.mode.optimize_flag()),
    ];
    if config.max_jobs > 0 {
        args.push(format!("-j{}", config.max_jobs));
    }
    args.extend(config.extra_flags.iter().cloned());

    let output_dir = config.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR);

    CommandPlan {
        program: toolchain.to_string(),
        args,
        output_path: project_path.join(output_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BuildMode;

    fn plan_default(target: BuildTarget) -> CommandPlan {
        plan(
            DEFAULT_TOOLCHAIN,
            Path::new("/work/demo"),
            target,
            &BuildConfig::default(),
        )
    }

    #[test]
    fn test_target_triples() {
        let expected = [
            (BuildTarget::Ios, "aarch64-macos"),
            (BuildTarget::Android, "aarch64-linux-android"),
            (BuildTarget::Web, "wasm32-freestanding"),
            (BuildTarget::Macos, "aarch64-macos"),
            (BuildTarget::Windows, "x86_64-windows"),
            (BuildTarget::Linux, "x86_64-linux"),
            (BuildTarget::Embedded, "thumb-freestanding"),
        ];
        assert_eq!(expected.len(), BuildTarget::all().len());
        for (target, triple) in expected {
            assert_eq!(target.triple(), triple);
            let plan = plan_default(target);
            assert!(plan.args.contains(&format!("-Dtarget={triple}")));
        }
    }

    #[test]
    fn test_optimize_flags() {
        let expected = [
            (BuildMode::Debug, "Debug"),
            (BuildMode::Release, "ReleaseFast"),
            (BuildMode::ReleaseSafe, "ReleaseSafe"),
            (BuildMode::ReleaseSmall, "ReleaseSmall"),
        ];
        assert_eq!(expected.len(), BuildMode::all().len());
        for (mode, flag) in expected {
            assert_eq!(mode.optimize_flag(), flag);
        }
    }

    #[test]
    fn test_argv_prefix_and_manifest() {
        let plan = plan_default(BuildTarget::Web);
        let argv = plan.argv();
        assert_eq!(argv[0], "zig");
        assert_eq!(argv[1], "build");

        let pos = argv.iter().position(|a| a == "--build-file").unwrap();
        assert_eq!(argv[pos + 1], "/work/demo/build.zig");
    }

    #[test]
    fn test_jobs_flag_only_when_requested() {
        let mut config = BuildConfig::default();
        assert!(
            !plan(DEFAULT_TOOLCHAIN, Path::new("/p"), BuildTarget::Linux, &config)
                .args
                .iter()
                .any(|a| a.starts_with("-j"))
        );

        config.max_jobs = 8;
        let plan = plan(DEFAULT_TOOLCHAIN, Path::new("/p"), BuildTarget::Linux, &config);
        assert!(plan.args.contains(&"-j8".to_string()));
    }

    #[test]
    fn test_extra_flags_appended_verbatim_in_order() {
        let config = BuildConfig {
            extra_flags: vec!["-Dcpu=baseline".to_string(), "--verbose".to_string()],
            ..Default::default()
        };
        let plan = plan(DEFAULT_TOOLCHAIN, Path::new("/p"), BuildTarget::Linux, &config);
        let n = plan.args.len();
        assert_eq!(plan.args[n - 2], "-Dcpu=baseline");
        assert_eq!(plan.args[n - 1], "--verbose");
    }

    #[test]
    fn test_output_path_convention() {
        let default_plan = plan_default(BuildTarget::Linux);
        assert_eq!(default_plan.output_path, Path::new("/work/demo/zig-out"));

        let config = BuildConfig {
            output_dir: Some("dist".to_string()),
            ..Default::default()
        };
        let overridden =
            plan(DEFAULT_TOOLCHAIN, Path::new("/work/demo"), BuildTarget::Linux, &config);
        assert_eq!(overridden.output_path, Path::new("/work/demo/dist"));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan_default(BuildTarget::Android);
        let b = plan_default(BuildTarget::Android);
        assert_eq!(a, b);
        assert_eq!(a.command_line(), b.command_line());
    }
}

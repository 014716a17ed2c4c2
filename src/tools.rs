//! Command lines for the vendor compiler and test runner.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::{CompilerConfig, TestRunnerConfig};
use crate::invocation::ChildInvocation;
use crate::paths::TargetArtifacts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// One model per target.
    Compile,
    /// One comma-separated set of test classes per target.
    Test,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Compile => "compile",
            TargetKind::Test => "test",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a class list: trim entries, drop empties, rejoin with commas.
pub fn normalize_class_list(classes: &str) -> String {
    classes
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn flag(name: &str, value: &Path) -> String {
    format!("-{name}={}", value.display())
}

/// Directory flag resolved against the project root. An unset directory
/// stays empty rather than silently becoming the root.
fn dir_flag(name: &str, root: &Path, value: &Path) -> String {
    if value.as_os_str().is_empty() {
        flag(name, value)
    } else {
        flag(name, &crate::paths::resolve_under(root, value))
    }
}

/// Compiler invocation for one model.
///
/// ```text
/// <compiler> -metadata=<dir> -compilermetadata=<dir> -modelmodule=<model>
///            -output=<dir> -referenceFolder=<dir> -xmlLog=<path>
///            -log=<path> [-verbose] [-incremental]
/// ```
pub fn compile_invocation(
    program: &Path,
    config: &CompilerConfig,
    root: &Path,
    model: &str,
    artifacts: &TargetArtifacts,
) -> ChildInvocation {
    let mut invocation = ChildInvocation::new(program, work_dir(config.work_dir.as_deref(), root))
        .arg(dir_flag("metadata", root, &config.metadata_dir))
        .arg(dir_flag("compilermetadata", root, &config.compiler_metadata_dir))
        .arg(format!("-modelmodule={model}"))
        .arg(dir_flag("output", root, &config.binaries_dir))
        .arg(dir_flag("referenceFolder", root, &config.reference_folder))
        .arg(flag("xmlLog", &artifacts.result_xml))
        .arg(flag("log", &artifacts.compile_log));
    if config.verbose {
        invocation = invocation.arg("-verbose");
    }
    if config.incremental {
        invocation = invocation.arg("-incremental");
    }
    if let Some(secs) = config.timeout_secs {
        invocation = invocation.timeout(Duration::from_secs(secs));
    }
    invocation
}

/// Test runner invocation for one set of classes.
///
/// ```text
/// <runner> -tests=<Class1,Class2,...> -xml=<path> [-parallel]
/// ```
pub fn test_invocation(
    program: &Path,
    config: &TestRunnerConfig,
    root: &Path,
    classes: &str,
    artifacts: &TargetArtifacts,
) -> ChildInvocation {
    let mut invocation = ChildInvocation::new(program, work_dir(config.work_dir.as_deref(), root))
        .arg(format!("-tests={}", normalize_class_list(classes)))
        .arg(flag("xml", &artifacts.result_xml));
    if config.parallel {
        invocation = invocation.arg("-parallel");
    }
    if let Some(secs) = config.timeout_secs {
        invocation = invocation.timeout(Duration::from_secs(secs));
    }
    invocation
}

/// Resolved tool locations plus their settings; builds one invocation per
/// target.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub root: PathBuf,
    pub compiler: PathBuf,
    pub test_runner: PathBuf,
    pub compiler_config: CompilerConfig,
    pub test_runner_config: TestRunnerConfig,
}

impl Toolchain {
    pub fn invocation(
        &self,
        kind: TargetKind,
        target: &str,
        artifacts: &TargetArtifacts,
    ) -> ChildInvocation {
        match kind {
            TargetKind::Compile => compile_invocation(
                &self.compiler,
                &self.compiler_config,
                &self.root,
                target,
                artifacts,
            ),
            TargetKind::Test => test_invocation(
                &self.test_runner,
                &self.test_runner_config,
                &self.root,
                target,
                artifacts,
            ),
        }
    }
}

fn work_dir(configured: Option<&Path>, root: &Path) -> PathBuf {
    match configured {
        Some(dir) => crate::paths::resolve_under(root, dir),
        None => root.to_path_buf(),
    }
}

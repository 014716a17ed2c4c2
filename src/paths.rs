use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::CONFIG_DIR;
use crate::relay::CapturePaths;
use crate::tools::TargetKind;

pub const COMPILER_ENV: &str = "TOOLDRIVE_COMPILER";
pub const TEST_RUNNER_ENV: &str = "TOOLDRIVE_TEST_RUNNER";

/// Directory that holds `.tooldrive/`, or `cwd` when running on defaults.
pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    config_path
        .and_then(Path::parent)
        .filter(|dir| dir.file_name().is_some_and(|n| n == CONFIG_DIR))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Where a tool location came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Environment,
    Config,
    SearchPath,
    /// Not found anywhere; the bare name is used and launching will fail.
    Unresolved,
}

impl ToolSource {
    pub fn label(self) -> &'static str {
        match self {
            ToolSource::Environment => "environment",
            ToolSource::Config => "config",
            ToolSource::SearchPath => "PATH",
            ToolSource::Unresolved => "unresolved",
        }
    }
}

/// Locate a tool: environment override, then a configured path, then `PATH`.
pub fn resolve_tool(env_var: &str, configured: &str, root: &Path) -> (PathBuf, ToolSource) {
    if let Some(value) = std::env::var_os(env_var).filter(|v| !v.is_empty()) {
        return (PathBuf::from(value), ToolSource::Environment);
    }

    let configured_path = Path::new(configured);
    if configured_path.components().count() > 1 {
        return (resolve_under(root, configured_path), ToolSource::Config);
    }

    match search_path(configured) {
        Some(found) => (found, ToolSource::SearchPath),
        None => (configured_path.to_path_buf(), ToolSource::Unresolved),
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let exe_name = if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(&exe_name))
        .find(|candidate| candidate.is_file())
}

/// File-system safe directory name for a target.
pub fn target_slug(target: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;

    for c in target.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let slug = out.trim_matches(|c| c == '-' || c == '.').to_string();
    if slug.is_empty() {
        "target".to_string()
    } else {
        slug
    }
}

/// Per-target files under `<output_dir>/<kind>/<target>/`.
#[derive(Debug, Clone)]
pub struct TargetArtifacts {
    pub dir: PathBuf,
    pub result_xml: PathBuf,
    pub compile_log: PathBuf,
    pub capture: CapturePaths,
}

impl TargetArtifacts {
    pub fn new(output_dir: &Path, kind: TargetKind, target: &str) -> Self {
        let dir = output_dir.join(kind.as_str()).join(target_slug(target));
        Self {
            result_xml: dir.join("result.xml"),
            compile_log: dir.join("compile.log"),
            capture: CapturePaths::in_dir(&dir),
            dir,
        }
    }

    /// Remove the previous run's files and recreate the directory.
    pub fn reset(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("failed to clear {}", self.dir.display()))?;
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
    }
}

pub fn run_log_path(output_dir: &Path) -> PathBuf {
    output_dir.join("run.jsonl")
}

pub fn summary_path(output_dir: &Path) -> PathBuf {
    output_dir.join("summary.json")
}

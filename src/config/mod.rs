use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bypass::BypassSchedule;
use crate::prompt::{DEFAULT_PROMPT_MARKER, PromptPatterns};
use crate::relay::RelaySettings;
use crate::supervisor::SupervisorSettings;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".tooldrive";

/// How a child tool is attached to the terminal.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Share our console; answer prompts by keystroke injection.
    #[default]
    Console,
    /// Pipe stdio; answer prompts by writing to the child's stdin.
    Captured,
}

impl RunMode {
    pub fn label(self) -> &'static str {
        match self {
            RunMode::Console => "console",
            RunMode::Captured => "captured",
        }
    }
}

/// Compiler section.
///
/// ```toml
/// [compiler]
/// program = 'C:\AOSService\PackagesLocalDirectory\bin\xppc.exe'
/// metadata_dir = 'C:\AOSService\PackagesLocalDirectory'
/// compiler_metadata_dir = 'C:\AOSService\PackagesLocalDirectory'
/// binaries_dir = 'C:\AOSService\PackagesLocalDirectory\MyModel\bin'
/// reference_folder = 'C:\AOSService\PackagesLocalDirectory'
/// incremental = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_compiler_program")]
    pub program: String,
    #[serde(default)]
    pub metadata_dir: PathBuf,
    #[serde(default)]
    pub compiler_metadata_dir: PathBuf,
    #[serde(default)]
    pub binaries_dir: PathBuf,
    #[serde(default)]
    pub reference_folder: PathBuf,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestRunnerConfig {
    #[serde(default = "default_test_runner_program")]
    pub program: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

/// Captured-mode prompt handling.
///
/// ```toml
/// [relay]
/// markers = ["Press any key to continue"]
/// patterns = ['(?i)attach a debugger']
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_detection_delay_millis")]
    pub detection_delay_millis: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Relative paths are resolved against the project root.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_compiler_program() -> String {
    "xppc".to_string()
}

fn default_test_runner_program() -> String {
    "SysTestConsole".to_string()
}

fn default_timeout_secs() -> u64 {
    20 * 60
}

fn default_warmup_secs() -> u64 {
    5
}

fn default_interval_secs() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    15
}

fn default_cancel_grace_secs() -> u64 {
    3
}

fn default_markers() -> Vec<String> {
    vec![DEFAULT_PROMPT_MARKER.to_string()]
}

fn default_detection_delay_millis() -> u64 {
    500
}

fn default_join_timeout_secs() -> u64 {
    5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("out")
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: default_compiler_program(),
            metadata_dir: PathBuf::new(),
            compiler_metadata_dir: PathBuf::new(),
            binaries_dir: PathBuf::new(),
            reference_folder: PathBuf::new(),
            work_dir: None,
            verbose: false,
            incremental: false,
            timeout_secs: None,
        }
    }
}

impl Default for TestRunnerConfig {
    fn default() -> Self {
        Self {
            program: default_test_runner_program(),
            work_dir: None,
            parallel: false,
            timeout_secs: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            timeout_secs: default_timeout_secs(),
            warmup_secs: default_warmup_secs(),
            interval_secs: default_interval_secs(),
            max_attempts: default_max_attempts(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            patterns: Vec::new(),
            detection_delay_millis: default_detection_delay_millis(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub test_runner: TestRunnerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.tooldrive/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config.validate().with_context(|| format!("invalid {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.supervisor.timeout_secs == 0 {
            anyhow::bail!("supervisor.timeout_secs must be greater than zero");
        }
        self.prompt_patterns()?;
        Ok(())
    }

    pub fn prompt_patterns(&self) -> Result<PromptPatterns> {
        PromptPatterns::from_markers(&self.relay.markers, &self.relay.patterns)
            .context("invalid relay.patterns entry")
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let s = &self.supervisor;
        SupervisorSettings {
            timeout: Duration::from_secs(s.timeout_secs),
            schedule: BypassSchedule {
                warmup: Duration::from_secs(s.warmup_secs),
                interval: Duration::from_secs(s.interval_secs),
                max_attempts: s.max_attempts,
            },
            cancel_grace: Duration::from_secs(s.cancel_grace_secs),
        }
    }

    pub fn relay_settings(&self) -> Result<RelaySettings> {
        Ok(RelaySettings {
            timeout: Duration::from_secs(self.supervisor.timeout_secs),
            patterns: self.prompt_patterns()?,
            detection_delay: Duration::from_millis(self.relay.detection_delay_millis),
            max_bypasses: self.supervisor.max_attempts,
            join_timeout: Duration::from_secs(self.relay.join_timeout_secs),
        })
    }
}

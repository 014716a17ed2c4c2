mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

use cli::{Cli, Command, ModeArg, ReportKind, RunArgs};
use tooldrive::config::{ProjectConfig, RunMode};
use tooldrive::log::ExecutionLog;
use tooldrive::orchestrator::{
    CapturedRunner, ConsoleRunner, Orchestrator, OrchestratorConfig, TargetRunner,
    report_existing, write_summary,
};
use tooldrive::paths::{self, COMPILER_ENV, TEST_RUNNER_ENV, ToolSource};
use tooldrive::summary::{AggregateSummary, EXIT_SENTINEL};
use tooldrive::tools::{self, TargetKind, Toolchain};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .tooldrive/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn optional_secs(value: Option<u64>) -> String {
    value
        .map(|s| format!("{s}s"))
        .unwrap_or_else(|| "(supervisor default)".to_string())
}

struct ResolvedTools {
    compiler: (PathBuf, ToolSource),
    test_runner: (PathBuf, ToolSource),
}

impl ResolvedTools {
    fn resolve(config: &ProjectConfig, root: &Path) -> Self {
        Self {
            compiler: paths::resolve_tool(COMPILER_ENV, &config.compiler.program, root),
            test_runner: paths::resolve_tool(TEST_RUNNER_ENV, &config.test_runner.program, root),
        }
    }
}

fn render_config_human(
    config: &ProjectConfig,
    tools: &ResolvedTools,
    config_path: Option<&Path>,
) -> String {
    let mut output = String::new();
    output.push_str("Compiler\n");
    push_kv(
        &mut output,
        "program",
        format!(
            "{} ({})",
            tools.compiler.0.display(),
            tools.compiler.1.label()
        ),
    );
    push_kv(&mut output, "metadata_dir", config.compiler.metadata_dir.display());
    push_kv(
        &mut output,
        "compiler_metadata_dir",
        config.compiler.compiler_metadata_dir.display(),
    );
    push_kv(&mut output, "binaries_dir", config.compiler.binaries_dir.display());
    push_kv(
        &mut output,
        "reference_folder",
        config.compiler.reference_folder.display(),
    );
    push_kv(&mut output, "verbose", config.compiler.verbose);
    push_kv(&mut output, "incremental", config.compiler.incremental);
    push_kv(&mut output, "timeout", optional_secs(config.compiler.timeout_secs));
    output.push('\n');

    output.push_str("Test Runner\n");
    push_kv(
        &mut output,
        "program",
        format!(
            "{} ({})",
            tools.test_runner.0.display(),
            tools.test_runner.1.label()
        ),
    );
    push_kv(&mut output, "parallel", config.test_runner.parallel);
    push_kv(&mut output, "timeout", optional_secs(config.test_runner.timeout_secs));
    output.push('\n');

    output.push_str("Supervisor\n");
    push_kv(&mut output, "mode", config.supervisor.mode.label());
    push_kv(&mut output, "timeout", format!("{}s", config.supervisor.timeout_secs));
    push_kv(&mut output, "warmup", format!("{}s", config.supervisor.warmup_secs));
    push_kv(&mut output, "interval", format!("{}s", config.supervisor.interval_secs));
    push_kv(&mut output, "max_attempts", config.supervisor.max_attempts);
    push_kv(
        &mut output,
        "cancel_grace",
        format!("{}s", config.supervisor.cancel_grace_secs),
    );
    output.push('\n');

    output.push_str("Relay\n");
    if config.relay.markers.is_empty() {
        push_kv(&mut output, "markers", "(none)");
    } else {
        push_kv(&mut output, "markers", config.relay.markers.join(", "));
    }
    if config.relay.patterns.is_empty() {
        push_kv(&mut output, "patterns", "(none)");
    } else {
        push_kv(&mut output, "patterns", config.relay.patterns.join(", "));
    }
    push_kv(
        &mut output,
        "detection_delay",
        format!("{}ms", config.relay.detection_delay_millis),
    );
    push_kv(
        &mut output,
        "join_timeout",
        format!("{}s", config.relay.join_timeout_secs),
    );
    output.push('\n');

    output.push_str("Output\n");
    push_kv(&mut output, "dir", config.output.dir.display());
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(
    config: &ProjectConfig,
    tools: &ResolvedTools,
    config_path: Option<&Path>,
) -> Result<String> {
    let payload = serde_json::json!({
        "compiler": {
            "program": tools.compiler.0.display().to_string(),
            "program_source": tools.compiler.1.label(),
            "metadata_dir": &config.compiler.metadata_dir,
            "compiler_metadata_dir": &config.compiler.compiler_metadata_dir,
            "binaries_dir": &config.compiler.binaries_dir,
            "reference_folder": &config.compiler.reference_folder,
            "work_dir": &config.compiler.work_dir,
            "verbose": config.compiler.verbose,
            "incremental": config.compiler.incremental,
            "timeout_secs": config.compiler.timeout_secs
        },
        "test_runner": {
            "program": tools.test_runner.0.display().to_string(),
            "program_source": tools.test_runner.1.label(),
            "work_dir": &config.test_runner.work_dir,
            "parallel": config.test_runner.parallel,
            "timeout_secs": config.test_runner.timeout_secs
        },
        "supervisor": {
            "mode": config.supervisor.mode,
            "timeout_secs": config.supervisor.timeout_secs,
            "warmup_secs": config.supervisor.warmup_secs,
            "interval_secs": config.supervisor.interval_secs,
            "max_attempts": config.supervisor.max_attempts,
            "cancel_grace_secs": config.supervisor.cancel_grace_secs
        },
        "relay": {
            "markers": &config.relay.markers,
            "patterns": &config.relay.patterns,
            "detection_delay_millis": config.relay.detection_delay_millis,
            "join_timeout_secs": config.relay.join_timeout_secs
        },
        "output": {
            "dir": &config.output.dir
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Command-line overrides win over the config file. A timeout given here
/// replaces the per-tool timeouts too.
fn apply_overrides(config: &mut ProjectConfig, args: &RunArgs) {
    if let Some(mode) = args.mode {
        config.supervisor.mode = match mode {
            ModeArg::Console => RunMode::Console,
            ModeArg::Captured => RunMode::Captured,
        };
    }
    if let Some(secs) = args.timeout_secs {
        config.supervisor.timeout_secs = secs;
        config.compiler.timeout_secs = None;
        config.test_runner.timeout_secs = None;
    }
}

fn check_targets(kind: TargetKind, targets: &[String]) -> Result<()> {
    for target in targets {
        let empty = match kind {
            TargetKind::Compile => target.trim().is_empty(),
            TargetKind::Test => tools::normalize_class_list(target).is_empty(),
        };
        if empty {
            anyhow::bail!("empty {kind} target: {target:?}");
        }
    }
    Ok(())
}

fn print_summary(summary: &AggregateSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", summary.to_json().context("failed to serialize summary")?);
    } else {
        print!("{}", summary.render_human());
    }
    Ok(())
}

fn execute(
    mut config: ProjectConfig,
    root: &Path,
    kind: TargetKind,
    targets: Vec<String>,
    args: RunArgs,
) -> Result<i32> {
    check_targets(kind, &targets)?;
    apply_overrides(&mut config, &args);

    let output_dir = paths::resolve_under(root, &config.output.dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let log = ExecutionLog::new(&paths::run_log_path(&output_dir))?;

    let tools = ResolvedTools::resolve(&config, root);
    let toolchain = Toolchain {
        root: root.to_path_buf(),
        compiler: tools.compiler.0,
        test_runner: tools.test_runner.0,
        compiler_config: config.compiler.clone(),
        test_runner_config: config.test_runner.clone(),
    };
    let runner: Box<dyn TargetRunner> = match config.supervisor.mode {
        RunMode::Console => Box::new(ConsoleRunner::new(config.supervisor_settings())),
        RunMode::Captured => Box::new(CapturedRunner::new(config.relay_settings()?)),
    };

    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig {
            toolchain,
            output_dir: output_dir.clone(),
        },
        runner,
    )
    .with_log(log);
    let summary = orchestrator.run(kind, &targets);

    match write_summary(&output_dir, &summary) {
        Ok(path) => info!("summary written to {}", path.display()),
        Err(e) => warn!(error = %format!("{e:#}"), "could not write summary"),
    }
    print_summary(&summary, args.json)?;
    Ok(summary.exit_code)
}

fn run(cli: Cli) -> Result<i32> {
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .tooldrive/config.toml found, using defaults"),
        }
    }
    let root = paths::project_root(config_path.as_deref(), &cwd);

    match cli.command {
        Command::Compile { models, run } => execute(config, &root, TargetKind::Compile, models, run),
        Command::Test { classes, run } => execute(config, &root, TargetKind::Test, classes, run),
        Command::Report {
            kind,
            targets,
            json,
        } => {
            let kind = match kind {
                ReportKind::Compile => TargetKind::Compile,
                ReportKind::Test => TargetKind::Test,
            };
            let output_dir = paths::resolve_under(&root, &config.output.dir);
            let summary = report_existing(&output_dir, kind, &targets);
            print_summary(&summary, json)?;
            Ok(summary.exit_code)
        }
        Command::Config { json } => {
            let tools = ResolvedTools::resolve(&config, &root);
            if json {
                println!(
                    "{}",
                    render_config_json(&config, &tools, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    render_config_human(&config, &tools, config_path.as_deref())
                );
            }
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "tooldrive=warn",
        0 => "tooldrive=info",
        1 => "tooldrive=debug",
        _ => "tooldrive=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(EXIT_SENTINEL as u8)),
        Err(e) => {
            eprintln!("tooldrive: {e:#}");
            ExitCode::from(EXIT_SENTINEL as u8)
        }
    }
}

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "tooldrive",
    about = "Unattended compile and test runs for interactive vendor build tools",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile one or more models, one target per model
    Compile {
        /// Model names
        #[arg(required = true)]
        models: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run test classes, one target per comma-separated class set
    Test {
        /// Class sets, e.g. "CustTest,VendTest" LedgerTest
        #[arg(required = true)]
        classes: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Re-read the most recent run's results without launching anything
    Report {
        kind: ReportKind,

        /// Targets as given to the original run
        #[arg(required = true)]
        targets: Vec<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show project configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Override supervisor.mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Override the per-target timeout, in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: Option<u64>,

    /// Print the summary as JSON instead of the human report
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Console,
    Captured,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
    Compile,
    Test,
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod completion;
mod dispatch;
mod render;
mod setup;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "appsweep")]
#[command(about = "Remove, reinstall and restore bundled Windows app packages", long_about = None)]
struct Cli {
    /// Package catalog to use instead of the built-in one.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Skip confirmation prompts.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    /// Relaunch elevated when administrator rights are missing.
    #[arg(long, global = true)]
    elevate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show every catalog package and whether it is installed.
    List,
    Remove(RemoveArgs),
    Reinstall(ReinstallArgs),
    /// Reinstall every catalog package that is missing, short of the store fallback.
    RestoreDefaults,
    /// Create a system restore point.
    Checkpoint,
    /// List installed packages that have not been launched recently.
    ScanUnused {
        #[arg(long, default_value_t = 90)]
        days: u32,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    Version,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    /// Remove every catalog package.
    #[arg(long, conflicts_with = "ids", required_unless_present = "ids")]
    all: bool,
    ids: Vec<String>,
}

#[derive(Args, Debug)]
struct ReinstallArgs {
    /// Reinstall every catalog package that is not installed.
    #[arg(long, conflicts_with = "ids", required_unless_present = "ids")]
    missing: bool,
    ids: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    dispatch::run_cli(cli)
}

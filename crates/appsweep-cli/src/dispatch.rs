use std::io::{self, BufRead, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use appsweep_core::{Catalog, Operation};
use appsweep_engine::{
    CommandExecutor, LifecycleEngine, OperationReport, PowerShellExecutor, PrivilegeGate,
    SystemPrivilegeGate,
};
use tracing::info;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_aggregate_lines, format_checkpoint_line, format_status_lines,
    format_unused_lines, print_section, render_status_line, OutputStyle, TerminalProgress,
};
use crate::setup::{init_tracing, load_catalog, load_config};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Completions { shell } => {
            let mut stdout = io::stdout().lock();
            write_completions_script(*shell, &mut stdout)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Version => {
            println!("appsweep {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging)?;
    let catalog = load_catalog(cli.catalog.as_deref())?;
    let style = current_output_style();

    let executor: Arc<dyn CommandExecutor> = Arc::new(PowerShellExecutor::new());
    let privilege = Arc::new(SystemPrivilegeGate::new());

    let operation = operation_for(&cli.command);
    if cli.elevate && operation.is_some() && !privilege.is_elevated() {
        println!(
            "{}",
            render_status_line(style, "warn", "relaunching with administrator rights")
        );
        privilege.request_elevation();
        return Ok(ExitCode::SUCCESS);
    }

    let engine = LifecycleEngine::new(catalog, config.engine, executor, privilege);

    match &cli.command {
        Commands::List => {
            for line in format_status_lines(&engine.catalog_status()) {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ScanUnused { days } => {
            let unused = engine.scan_unused(i64::from(*days))?;
            for line in format_unused_lines(&unused, *days) {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            let operation =
                operation.ok_or_else(|| anyhow!("command does not map to an operation"))?;
            run_operation(&engine, &operation, style, cli.yes)
        }
    }
}

pub(crate) fn operation_for(command: &Commands) -> Option<Operation> {
    match command {
        Commands::Remove(args) if args.all => Some(Operation::RemoveAll),
        Commands::Remove(args) => Some(Operation::Remove(args.ids.clone())),
        Commands::Reinstall(args) if args.missing => Some(Operation::ReinstallMissing),
        Commands::Reinstall(args) => Some(Operation::Reinstall(args.ids.clone())),
        Commands::RestoreDefaults => Some(Operation::RestoreDefaults),
        Commands::Checkpoint => Some(Operation::CreateCheckpoint),
        Commands::List
        | Commands::ScanUnused { .. }
        | Commands::Completions { .. }
        | Commands::Version => None,
    }
}

fn run_operation(
    engine: &LifecycleEngine,
    operation: &Operation,
    style: OutputStyle,
    assume_yes: bool,
) -> Result<ExitCode> {
    if operation.is_mutating() && !assume_yes {
        let prompt = confirmation_prompt(operation, engine.catalog());
        if !confirm(&prompt)? {
            println!("Aborted.");
            return Ok(ExitCode::FAILURE);
        }
    }

    let mut progress = TerminalProgress::new(style, operation.label());
    let report = engine.run_with_progress(operation, &mut progress)?;
    progress.finish();

    print_section(style, operation.label());
    match &report {
        OperationReport::Packages(result) => {
            if result.attempted() == 0 && result.aborted.is_none() {
                println!(
                    "{}",
                    render_status_line(style, "ok", "every catalog package is already installed")
                );
            } else {
                for line in format_aggregate_lines(style, result) {
                    println!("{line}");
                }
            }
        }
        OperationReport::Checkpoint(checkpoint) => {
            println!("{}", format_checkpoint_line(style, checkpoint));
        }
    }

    info!("{} finished", operation.label());
    Ok(exit_code_for(&report))
}

pub(crate) fn report_succeeded(report: &OperationReport) -> bool {
    match report {
        OperationReport::Packages(result) => {
            result.aborted.is_none() && (result.attempted() == 0 || result.succeeded())
        }
        OperationReport::Checkpoint(checkpoint) => checkpoint.is_created(),
    }
}

fn exit_code_for(report: &OperationReport) -> ExitCode {
    if report_succeeded(report) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub(crate) fn confirmation_prompt(operation: &Operation, catalog: &Catalog) -> String {
    let action = match operation {
        Operation::RemoveAll => format!("remove all {} catalog packages", catalog.len()),
        Operation::Remove(ids) => format!("remove {}", ids.join(", ")),
        Operation::Reinstall(ids) => format!("reinstall {}", ids.join(", ")),
        Operation::ReinstallMissing => "reinstall every missing catalog package".to_string(),
        Operation::RestoreDefaults => {
            format!("restore all {} catalog packages", catalog.len())
        }
        Operation::CreateCheckpoint => "create a restore point".to_string(),
    };
    format!("About to {action}. Continue? [y/N] ")
}

pub(crate) fn parse_confirmation(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn confirm(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Err(anyhow!(
            "confirmation required but stdin is not a terminal; pass --yes"
        ));
    }

    print!("{prompt}");
    io::stdout().flush().context("failed to flush prompt")?;
    let mut answer = String::new();
    stdin
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(parse_confirmation(&answer))
}

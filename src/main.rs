//! modhost - command line entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use modhost::cli::{Cli, Commands};
use modhost::process_guard::{self, CancellationToken, ProcessGuard};
use modhost::report::EXIT_USAGE;
use modhost::{
    AptPackageManager, EntryPointRunner, FileRegistry, MemoryRegistry, ModulePath, Orchestrator,
    OrchestratorConfig, RegistryStore, SystemRunner, SystemctlProbe, PURGE_TOKEN,
};

/// Logs go to stderr; stdout carries only the result table
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn main() {
    // clap exits with status 2 on usage errors
    let cli = Cli::parse();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::resolve(cli.config.as_deref())?;
    if let Some(root) = &cli.modules_root {
        config.modules_root = root.clone();
    }
    if let Some(dir) = &cli.registry_dir {
        config.registry_dir = dir.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    info!(
        "modhost starting: modules_root={:?} registry_dir={:?}{}",
        config.modules_root,
        config.registry_dir,
        if cli.dry_run { " [DRY RUN]" } else { "" }
    );

    // Read before anything is discovered or touched
    let confirmation = match &cli.command {
        Commands::Purge { module, confirm } => confirm
            .clone()
            .or_else(|| prompt_purge_token(module.as_ref())),
        _ => None,
    };

    let cancel = CancellationToken::new();
    if let Err(e) = process_guard::install_signal_handlers(cancel.clone()) {
        warn!("Failed to install signal handlers: {}", e);
    }
    // Dropped before exit, terminating anything still running
    let _guard = ProcessGuard;

    let file_registry = FileRegistry::new(&config.registry_dir);
    let registry: Box<dyn RegistryStore> = if cli.dry_run {
        Box::new(
            MemoryRegistry::snapshot(&file_registry)
                .context("Failed to read registry for dry run")?,
        )
    } else {
        Box::new(file_registry)
    };

    let runner = SystemRunner::new(cli.dry_run);
    let mut orchestrator = Orchestrator::new(
        config.clone(),
        registry,
        Box::new(EntryPointRunner::new(
            runner,
            config.action_timeout(),
            &config.config_root,
        )),
        Box::new(AptPackageManager::new(runner, config.package_timeout())),
        Box::new(SystemctlProbe::new(runner)),
    )
    .with_cancellation(cancel)
    .with_dry_run(cli.dry_run);

    let target = cli.command.module();
    let code = match &cli.command {
        Commands::Install { .. } => {
            let report = orchestrator.install(target);
            print!("{}", report);
            report.exit_code()
        }
        Commands::Uninstall { .. } => {
            let report = orchestrator.uninstall(target);
            print!("{}", report);
            report.exit_code()
        }
        Commands::Purge { .. } => {
            let report = orchestrator.purge(target, confirmation.as_deref());
            print!("{}", report);
            report.exit_code()
        }
        Commands::Status { live, .. } => {
            let report = orchestrator.status(target, *live);
            print!("{}", report);
            report.exit_code()
        }
    };
    io::stdout().flush().context("Failed to write report")?;
    Ok(code)
}

/// Ask for the purge token on stdin. EOF or a read error counts as "no".
fn prompt_purge_token(target: Option<&ModulePath>) -> Option<String> {
    let scope = target
        .map(|t| t.to_string())
        .unwrap_or_else(|| "every module with a registry record".to_string());
    eprintln!(
        "Purge permanently erases the registry record, configuration, logs and unused packages of {}.",
        scope
    );
    eprint!("Type {} to continue: ", PURGE_TOKEN);
    let _ = io::stderr().flush();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

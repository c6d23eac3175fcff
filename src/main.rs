use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use storm::config::{AgentCommand, Command, Config, FleetArgs, InstallMode};
use storm::fleet::{AgentBuilder, FleetOrchestrator, FleetReport};
use storm::{CommandExecutor, Console, Inventory, JobRunner, Result, SshConnector, WorkflowDocument};

fn init_logging() {
    let filter = EnvFilter::try_from_env("STORM_LOG").unwrap_or_else(|_| EnvFilter::new("storm=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_local(file: &Path, directory: Option<&str>, trash: bool) -> Result<bool> {
    let mut document = WorkflowDocument::load(file)?;
    if document.directory.is_none() {
        document.directory = directory.map(str::to_string);
    }

    let console = Console::new();
    let results = JobRunner::new(CommandExecutor::new(), &console)
        .run_document(&document)
        .await;

    if !results.all_succeeded() {
        eprintln!(
            "[Storm] Workflow '{}' failed. Jobs not succeeded: {}",
            document.name,
            results.failed_jobs().join(", ")
        );
        return Ok(false);
    }
    if trash {
        std::fs::remove_file(file)?;
    }
    Ok(true)
}

fn orchestrator(fleet: &FleetArgs) -> FleetOrchestrator<SshConnector> {
    FleetOrchestrator::new(SshConnector::new(fleet.ssh_options())).with_parallelism(fleet.parallelism)
}

fn summarize(report: &FleetReport) -> bool {
    if report.is_success() {
        return true;
    }
    eprintln!(
        "[Storm] {} of {} hosts failed:\n{}",
        report.failures().count(),
        report.outcomes().len(),
        report.failure_summary()
    );
    false
}

async fn run_agent(command: &AgentCommand) -> Result<bool> {
    let report = match command {
        AgentCommand::Run { file, fleet } => {
            let document = WorkflowDocument::load(file)?;
            let inventory = Inventory::load(&fleet.inventory)?;
            orchestrator(fleet).run(&document, &inventory).await?
        }
        AgentCommand::Install {
            fleet,
            mode,
            script_base,
            project_dir,
        } => {
            let inventory = Inventory::load(&fleet.inventory)?;
            let mut orchestrator = orchestrator(fleet).with_script_base(script_base);
            if *mode == InstallMode::Dev {
                orchestrator = orchestrator.with_builder(AgentBuilder::new(project_dir));
            }
            orchestrator.install(*mode, &inventory).await
        }
        AgentCommand::Uninstall { fleet } => {
            let inventory = Inventory::load(&fleet.inventory)?;
            orchestrator(fleet).uninstall(&inventory).await
        }
    };
    Ok(summarize(&report))
}

async fn dispatch(config: &Config) -> Result<bool> {
    match &config.command {
        Command::Run {
            file,
            directory,
            trash,
        } => run_local(file, directory.as_deref(), *trash).await,
        Command::Agent { command } => run_agent(command).await,
        Command::Version => {
            println!("storm {}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let config = Config::parse();

    // Dropping the in-flight work on Ctrl-C kills running steps and their children.
    let outcome = tokio::select! {
        outcome = dispatch(&config) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[Storm] Interrupted.");
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("[Storm] {}", err);
            ExitCode::FAILURE
        }
    }
}

//! gce-rescue - Main entry point
//!
//! Loads the VM once, asks for confirmation, then runs the pipeline for the
//! direction the VM's rescue flag selects.

use anyhow::{Context, Result};
use gce_rescue::cli::Cli;
use gce_rescue::compute::{ComputeApi, ComputeClient, Location, SimulatedCompute};
use gce_rescue::config::RescueConfig;
use gce_rescue::instance::InstanceState;
use gce_rescue::pipeline::{TaskPipeline, Transition};
use gce_rescue::progress::{ProgressHandle, ProgressTracker};
use gce_rescue::{auth, messages};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code after Ctrl-C, as a shell would report it
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Send all logging to `<vm-name>.log`.
fn init_logging(cli: &Cli) -> Result<()> {
    let path = cli.log_file();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        // Allows RUST_LOG env var to override
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Ctrl-C leaves the VM wherever the last completed step put it.
fn install_interrupt_handler(vm_name: String) {
    let result = ctrlc::set_handler(move || {
        warn!("Interrupted; {} is left in its last intermediate state", vm_name);
        eprintln!(
            "\nInterrupted. The instance {} may be left in an intermediate state; \
             see {}.log and run gce-rescue again once it settles.",
            vm_name, vm_name
        );
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });
    if let Err(e) = result {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }
}

fn load_config(cli: &Cli) -> Result<RescueConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            RescueConfig::load_from_file(path)?
        }
        None => RescueConfig::default(),
    };
    if cli.skip_snapshot {
        config.skip_snapshot = true;
    }
    config.validate().context("Invalid configuration")?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

/// Ask on stdin; anything but yes stops the run.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(messages::is_confirmed(&answer))
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    let project = auth::resolve_project(cli.project.as_deref())?;
    let location = Location::new(project, cli.zone.as_str());
    let token = auth::access_token()?;
    let client = match &config.api_endpoint {
        Some(endpoint) => ComputeClient::with_endpoint(endpoint.as_str(), token)?,
        None => ComputeClient::new(token)?,
    };
    let live: Arc<dyn ComputeApi> = Arc::new(client);

    let vm = InstanceState::load(live.as_ref(), location, &cli.name)
        .with_context(|| format!("Failed to load instance {}", cli.name))?;
    let pipeline = TaskPipeline::for_state(&vm, &config);
    info!("{}", pipeline.summary());

    if cli.dry_run {
        return dry_run(live.as_ref(), vm, &config, &pipeline);
    }

    if !cli.force {
        let prompt = match pipeline.transition() {
            Transition::EnterRescue => messages::confirm_enter(&vm),
            Transition::ExitRescue => messages::confirm_exit(&vm),
        };
        if !confirm(&prompt)? {
            info!("Cancelled by user");
            println!("Cancelled.");
            return Ok(());
        }
    }

    match pipeline.transition() {
        Transition::EnterRescue => {
            println!("Starting...");
            // The original configuration stays recoverable from the log file
            info!("{}", vm.restore_record()?);
        }
        Transition::ExitRescue => println!("Restoring VM..."),
    }

    execute(live, vm, &config, &pipeline)
}

fn execute(
    api: Arc<dyn ComputeApi>,
    mut vm: InstanceState,
    config: &RescueConfig,
    pipeline: &TaskPipeline,
) -> Result<()> {
    let tracker = ProgressTracker::start(pipeline.steps().len(), io::stderr())?;
    let result = pipeline.run(api, &mut vm, config, &tracker.handle());
    tracker.close(result.is_ok());
    result?;

    let tip = match pipeline.transition() {
        Transition::EnterRescue => messages::tip_connect_ssh(&vm),
        Transition::ExitRescue => messages::tip_restore_disk(&vm),
    };
    println!("{}", tip);
    Ok(())
}

/// Run the pipeline against an in-memory copy of the VM and print the calls.
fn dry_run(
    live: &dyn ComputeApi,
    mut vm: InstanceState,
    config: &RescueConfig,
    pipeline: &TaskPipeline,
) -> Result<()> {
    let sim = Arc::new(SimulatedCompute::mirror(live, &vm)?);
    let config = RescueConfig {
        operation_poll_interval_ms: 0,
        ..config.clone()
    };

    println!("DRY RUN: {} is not modified.", vm.name);
    println!("{}", pipeline.summary());

    let api: Arc<dyn ComputeApi> = sim.clone();
    let result = pipeline.run(api, &mut vm, &config, &ProgressHandle::disabled());

    println!("Control-plane calls:");
    for (i, call) in sim.journal().iter().enumerate() {
        println!("  {}. {}", i + 1, call);
    }
    result.context("Dry run failed")
}

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = init_logging(&cli) {
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
    info!("gce-rescue {} starting for {}", env!("CARGO_PKG_VERSION"), cli.name);
    install_interrupt_handler(cli.name.clone());

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

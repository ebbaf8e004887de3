//! padkill - Home + Triangle controller disconnect daemon
//!
//! Watches wireless PlayStation controllers on Linux and drops their
//! Bluetooth link when Home and Triangle are held together.

mod bluetooth;
mod cli;
mod decoder;
mod device;
mod registry;
mod service;
mod settings;
mod supervisor;
mod worker;

use anyhow::{Context, Result};
use bluetooth::BluezClient;
use cli::Command;
use device::UdevSource;
use registry::WorkerRegistry;
use service::{InstallOutcome, ServiceManager, UninstallOutcome};
use settings::Settings;
use std::time::Duration;
use supervisor::Supervisor;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::ThreadSpawner;

fn main() -> Result<()> {
    let args = match cli::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("padkill: {e}\n\n{}", cli::USAGE);
            std::process::exit(1);
        }
    };

    init_logging(args.debug);

    match args.command {
        Command::Help => {
            println!("{}", cli::USAGE);
            Ok(())
        }
        Command::Install => install(),
        Command::Uninstall => uninstall(),
        Command::Run => run_daemon(),
    }
}

/// Quiet by default; `-d` turns on diagnostics, `RUST_LOG` overrides both
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn install() -> Result<()> {
    match ServiceManager::system()?.install()? {
        InstallOutcome::Installed => println!("padkill service installed and started"),
        InstallOutcome::AlreadyInstalled => println!("padkill service is already installed"),
    }
    Ok(())
}

fn uninstall() -> Result<()> {
    match ServiceManager::system()?.uninstall()? {
        UninstallOutcome::Removed => println!("padkill service removed"),
        UninstallOutcome::NotFound => println!("padkill service not found"),
    }
    Ok(())
}

fn run_daemon() -> Result<()> {
    let settings = Settings::load()?;
    info!("padkill starting...");
    info!("Watching for: {:?}", settings.controller_names);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to install signal handler")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(async move {
        let (combo_tx, combo_rx) = mpsc::unbounded_channel();
        let disconnector = tokio::spawn(bluetooth::run_disconnect_task(combo_rx, BluezClient::connect));

        let supervisor = Supervisor::new(
            UdevSource::new(),
            ThreadSpawner::new(settings.combo_codes(), combo_tx),
            WorkerRegistry::new(settings.state_dir()),
            settings.controller_names.clone(),
            settings.scan_interval(),
        );

        let result = supervisor.run(shutdown_rx).await;
        disconnector.abort();
        result
    });

    // Don't hang on a D-Bus call that is still in flight
    runtime.shutdown_timeout(Duration::from_secs(1));

    info!("padkill shutting down");
    result
}

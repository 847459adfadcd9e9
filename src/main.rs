//! CLI Entry Point for prodline
//!
//! Provides command-line interface for:
//! - Listing serial ports
//! - Running a labeling batch against the device
//! - Simulating a batch against the built-in mock device
//! - Validating configuration
//!
//! # Usage
//!
//! ```bash
//! prodline ports
//! prodline run --order order.toml --target 25 --operator-id 17 --operator jdoe
//! prodline simulate --target 25
//! prodline check-config --config config/prodline.toml
//! ```
//!
//! Ctrl+C during a run performs an operator stop: the emergency stop command is
//! sent and the labels printed so far are saved.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use prodline::config::{AppConfig, DEFAULT_CONFIG_PATH};
use prodline::device::{DeviceSession, SessionConfig};
use prodline::error::ProdlineError;
use prodline::hardware::mock::{MockChooser, MockDevice};
use prodline::hardware::DeviceChooser;
use prodline::logging;
use prodline::printing::{LabelPrinter, MemoryPrinter, SpoolPrinter};
use prodline::production::{
    Operator, ProductionOrder, ProductionSettings, RunController, RunOutcome, StopOutcome,
    StopReason,
};
use prodline::storage::{JsonRunStore, StoredRun};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Save attempts made after a failed save before giving up.
const SAVE_ATTEMPTS: usize = 3;

/// Pause between save attempts and between automatic resumes.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to do when printing or the device interrupts a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnError {
    /// Ask the operator
    Prompt,
    /// Resume the run after a short pause
    Retry,
    /// Stop and save what was printed
    Stop,
}

#[derive(Parser)]
#[command(name = "prodline")]
#[command(about = "Labeling line controller for serial label applicators", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// What to do when printing or the device interrupts a run
    #[arg(long, global = true, value_enum, default_value_t = OnError::Prompt)]
    on_error: OnError,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports visible to this host
    Ports,

    /// Run a labeling batch on the connected device
    Run {
        /// Production order file (TOML)
        #[arg(long)]
        order: PathBuf,

        /// Number of units to label
        #[arg(long)]
        target: String,

        /// Serial port, overriding device.port
        #[arg(long)]
        port: Option<String>,

        /// Operator id recorded in the run log
        #[arg(long, default_value = "0")]
        operator_id: String,

        /// Operator name recorded in the run log
        #[arg(long, default_value = "operator")]
        operator: String,
    },

    /// Run a batch against the simulated device
    Simulate {
        /// Number of units to label
        #[arg(long, default_value = "25")]
        target: String,

        /// Production order file (TOML); a demo order is used otherwise
        #[arg(long)]
        order: Option<PathBuf>,

        /// Write labels to the configured spool directory instead of memory
        #[arg(long)]
        spool: bool,

        /// Directory for the run log, overriding storage.output_dir
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load and validate configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Run {
            order,
            target,
            port,
            operator_id,
            operator,
        } => {
            let order = ProductionOrder::from_toml_file(&order)?;
            run_batch(
                &config,
                order,
                &target,
                port,
                Operator::new(operator_id, operator),
                cli.on_error,
            )
            .await
        }
        Commands::Simulate {
            target,
            order,
            spool,
            output,
        } => {
            simulate(
                &config,
                order.as_deref(),
                &target,
                spool,
                output,
                cli.on_error,
            )
            .await
        }
        Commands::CheckConfig => check_config(&cli.config, &config),
    }
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    let ports = prodline::hardware::serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}  {:?}", port.port_name, port.port_type);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    Err(ProdlineError::SerialFeatureDisabled.into())
}

#[cfg(feature = "serial")]
fn serial_chooser(port: Option<String>) -> Result<Arc<dyn DeviceChooser>> {
    Ok(Arc::new(prodline::hardware::SerialPortChooser::new(port)))
}

#[cfg(not(feature = "serial"))]
fn serial_chooser(_port: Option<String>) -> Result<Arc<dyn DeviceChooser>> {
    Err(ProdlineError::SerialFeatureDisabled.into())
}

async fn run_batch(
    config: &AppConfig,
    order: ProductionOrder,
    target: &str,
    port: Option<String>,
    operator: Operator,
    on_error: OnError,
) -> Result<()> {
    let chooser = serial_chooser(port.or_else(|| config.device.port.clone()))?;
    let session = DeviceSession::new(chooser, SessionConfig::from(&config.device));
    session.request_access().await?;
    session.connect().await?;

    let controller = RunController::new(
        session.clone(),
        Arc::new(SpoolPrinter::from_config(&config.printer)),
        Arc::new(JsonRunStore::new(config.storage.output_dir.clone())),
        operator,
        ProductionSettings::from(&config.production),
    );

    let result = drive(&controller, order, target, on_error).await;
    session.disconnect().await;
    result
}

async fn simulate(
    config: &AppConfig,
    order: Option<&Path>,
    target: &str,
    spool: bool,
    output: Option<PathBuf>,
    on_error: OnError,
) -> Result<()> {
    let order = match order {
        Some(path) => ProductionOrder::from_toml_file(path)?,
        None => demo_order(),
    };

    let device = MockDevice::new();
    let session = DeviceSession::new(
        Arc::new(MockChooser::granting(device.clone())),
        SessionConfig::from(&config.device),
    );
    session.request_access().await?;
    session.connect().await?;

    let printer: Arc<dyn LabelPrinter> = if spool {
        Arc::new(SpoolPrinter::from_config(&config.printer))
    } else {
        Arc::new(MemoryPrinter::new())
    };
    let output_dir = output.unwrap_or_else(|| config.storage.output_dir.clone());

    let controller = RunController::new(
        session.clone(),
        printer,
        Arc::new(JsonRunStore::new(output_dir)),
        Operator::new("0", "simulator"),
        ProductionSettings::from(&config.production),
    );

    let result = drive(&controller, order, target, on_error).await;
    session.disconnect().await;

    println!();
    println!("Device transcript:");
    for entry in session.log().entries() {
        println!("  {}", entry);
    }
    info!(commands = device.commands().len(), "Simulation finished");
    result
}

/// Start a run and drive it to completion, stopping on Ctrl+C.
async fn drive(
    controller: &RunController,
    order: ProductionOrder,
    target: &str,
    on_error: OnError,
) -> Result<()> {
    controller.request_start(Some(order))?;
    let target = controller.submit_target(target)?;
    println!("Labeling {} units. Press Ctrl+C to stop.", target);

    loop {
        let runner = controller.clone();
        let mut execution = tokio::spawn(async move { runner.execute().await });

        let result = tokio::select! {
            joined = &mut execution => joined?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Stopping...");
                match controller.stop(StopReason::Operator).await {
                    Ok(StopOutcome::Saved(stored)) => {
                        execution.abort();
                        report(&stored);
                        return Ok(());
                    }
                    // The completion stop owns the run; its result comes from execute.
                    Ok(StopOutcome::AlreadyStopping) => execution.await?,
                    Err(ProdlineError::Persistence(msg)) => {
                        execution.abort();
                        warn!("Saving run failed: {}", msg);
                        return save_pending(controller).await;
                    }
                    Err(e) => {
                        execution.abort();
                        return Err(e.into());
                    }
                }
            }
        };

        match result {
            Ok(RunOutcome::Finished(stored)) => {
                report(&stored);
                return Ok(());
            }
            Ok(RunOutcome::Stopped) => return save_pending(controller).await,
            Err(ProdlineError::Persistence(msg)) => {
                warn!("Saving run failed: {}", msg);
                return save_pending(controller).await;
            }
            Err(e) => {
                eprintln!("Run interrupted: {}", e);
                let resume = match on_error {
                    OnError::Prompt => ask_resume().await?,
                    OnError::Retry => {
                        tokio::time::sleep(RETRY_DELAY).await;
                        true
                    }
                    OnError::Stop => false,
                };
                if !resume {
                    return stop_run(controller).await;
                }
                println!("Resuming...");
            }
        }
    }
}

/// Ask the operator whether to resume an interrupted run.
async fn ask_resume() -> Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("[r]esume or [s]top and save?");
        match lines.next_line().await? {
            Some(line) => match line.trim() {
                "r" | "resume" => return Ok(true),
                "s" | "stop" => return Ok(false),
                _ => {}
            },
            None => return Ok(false),
        }
    }
}

/// Operator stop, then make sure the run is saved.
async fn stop_run(controller: &RunController) -> Result<()> {
    match controller.stop(StopReason::Operator).await {
        Ok(StopOutcome::Saved(stored)) => {
            report(&stored);
            Ok(())
        }
        Ok(StopOutcome::AlreadyStopping) => save_pending(controller).await,
        Err(ProdlineError::Persistence(msg)) => {
            warn!("Saving run failed: {}", msg);
            save_pending(controller).await
        }
        Err(e) => Err(e.into()),
    }
}

/// Save a stopped run that is not saved yet, retrying failed saves.
async fn save_pending(controller: &RunController) -> Result<()> {
    let stored = match controller.last_saved() {
        Some(stored) => stored,
        None => controller.retry_save(SAVE_ATTEMPTS, RETRY_DELAY).await?,
    };
    report(&stored);
    Ok(())
}

fn report(stored: &StoredRun) {
    let record = &stored.record;
    println!();
    println!("Run saved ({})", stored.id);
    println!("  Batch:    {}", record.batch);
    println!("  Produced: {} of {}", record.total_produced, record.target_count);
    println!("  Stopped:  {}", record.stop_reason);
    if let Some(path) = &stored.path {
        println!("  Log:      {}", path.display());
    }
}

fn check_config(path: &Path, config: &AppConfig) -> Result<()> {
    println!("Configuration OK ({})", path.display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn demo_order() -> ProductionOrder {
    ProductionOrder {
        order_number: "SIM-0001".to_string(),
        material: "MAT-1000".to_string(),
        batch: "SIM".to_string(),
        vendor_batch: "V-SIM".to_string(),
        description: "Simulated unit".to_string(),
    }
}

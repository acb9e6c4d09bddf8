use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use spotheat::cli::{Cli, Commands};
use spotheat::config::Config;
use spotheat::daemon::ControlLoop;
use spotheat::device::{DeviceChannel, ShellyRpc};
use spotheat::plan::EntryReason;
use spotheat::store;
use spotheat::watchdog::{SweepOutcome, Watchdog, sweep_now};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spotheat")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("spotheat.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn device(config: &Config) -> Arc<ShellyRpc> {
    Arc::new(ShellyRpc::new(
        &config.device.endpoint,
        config.device.relay_id,
    ))
}

async fn run_application(cli: &Cli, config: Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run => run_controller(config).await,
        Commands::Watchdog => run_watchdog(config).await,
        Commands::Plan => show_plan(config).await,
        Commands::Status => show_status(config).await,
        Commands::Cleanup => run_cleanup(config).await,
    }
}

async fn run_controller(config: Config) -> Result<()> {
    println!(
        "{} {}",
        "Controlling relay at".cyan(),
        config.device.endpoint
    );
    let rpc = device(&config);
    let mut control = ControlLoop::new(config, Arc::clone(&rpc), rpc);
    control.run().await?;
    Ok(())
}

async fn run_watchdog(config: Config) -> Result<()> {
    println!(
        "{} {}",
        "Watching controller pidfile".cyan(),
        config.daemon.pidfile.display()
    );
    let rpc = device(&config);
    let watchdog = Watchdog::new(&config, Arc::clone(&rpc), rpc);
    watchdog.run().await?;
    Ok(())
}

async fn show_plan(config: Config) -> Result<()> {
    let rpc = device(&config);
    let clock = rpc.clock().await.context("Failed to read device clock")?;
    if !clock.is_valid() {
        bail!("device has no valid time yet; try again once it has synced");
    }

    let control = ControlLoop::new(config, Arc::clone(&rpc), rpc);
    let (plan, _stamps, degraded) = control.build_plan(clock).await;

    if degraded {
        println!(
            "{}",
            "Price data unavailable - showing the fallback plan".yellow()
        );
    }
    if plan.is_empty() {
        println!("{}", "No hours selected for heating.".yellow());
        return Ok(());
    }

    println!("{}", "Heating plan:".green());
    for entry in &plan.entries {
        let why = match entry.reason {
            EntryReason::CheapestInPeriod => "cheapest in period",
            EntryReason::AlwaysOn => "below always-on price",
            EntryReason::Fallback => "fallback",
        };
        match entry.price {
            Some(price) => println!("  {:02}:00  {:>8.2} EUR/MWh  {}", entry.hour, price, why),
            None => println!("  {:02}:00  {:>8}  {}", entry.hour, "-", why),
        }
    }
    Ok(())
}

async fn show_status(config: Config) -> Result<()> {
    let rpc = device(&config);

    let state = store::load_state(&*rpc)
        .await
        .context("Failed to read persisted state")?;
    println!("{}", "Persisted state:".green());
    println!("  installed handles: {:?}", state.installed_handles);
    println!("  last price fetch:  {}", format_ts(state.last_price_ts));
    println!("  last forecast:     {}", format_ts(state.last_forecast_ts));

    let installed = rpc
        .list_schedules()
        .await
        .context("Failed to list device schedules")?;
    println!("{}", "Device schedule entries:".green());
    if installed.is_empty() {
        println!("  (none)");
    }
    for entry in installed {
        let action = if entry.on { "on" } else { "off" };
        println!("  #{:<4} {} -> {}", entry.handle, entry.timespec, action);
    }
    Ok(())
}

async fn run_cleanup(config: Config) -> Result<()> {
    let rpc = device(&config);
    let outcome = sweep_now(&config, Arc::clone(&rpc), rpc)
        .await
        .context("Cleanup sweep failed")?;
    match outcome {
        SweepOutcome::Idle => println!("{}", "Nothing installed, nothing to clean.".green()),
        SweepOutcome::Cleaned { deleted, failed } => {
            println!("{} {} deleted, {} failed", "Cleaned:".green(), deleted, failed);
        }
    }
    Ok(())
}

fn format_ts(ts: Option<i64>) -> String {
    match ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0)) {
        Some(dt) => dt.to_rfc3339(),
        None => "never".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, config).await.context("Application failed")?;

    Ok(())
}

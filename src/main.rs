//! GPS Collector Binary Entry Point
//!
//! Runs the collection loop until Ctrl+C / SIGTERM.
//! Core functionality is provided by the `gps_collector` library crate.
//!
//! Exit codes: 0 clean shutdown, 1 fatal runtime error, 78 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gps_collector::{
    AppConfig, CollectorError, ConfigError, FleetUpClient, RunSummary, Scheduler, StopHandle,
    config::{LogConfig, LogFormat, LogLevel, parse_interval},
    stop_channel, telemetry,
};

/// Exit code for configuration errors (`EX_CONFIG`).
const EXIT_CONFIG: u8 = 78;

/// GPS Collector - FleetUp vehicle location collector
#[derive(Parser, Debug)]
#[command(name = "gps-collector", version, about, long_about = None)]
struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(short, long, env = "GPS_COLLECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// FleetUp account id (overrides config file)
    #[arg(long, env = "FLEETUP_ACCOUNT_ID")]
    account_id: Option<String>,

    /// FleetUp secret key (overrides config file)
    #[arg(long, env = "FLEETUP_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// FleetUp API key (overrides config file)
    #[arg(long, env = "FLEETUP_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// FleetUp API base URL (overrides config file)
    #[arg(long, env = "FLEETUP_BASE_URL")]
    base_url: Option<String>,

    /// Collection interval: seconds or a duration like `5m` (overrides config file)
    #[arg(long, env = "COLLECTION_INTERVAL", value_parser = parse_interval)]
    interval: Option<Duration>,

    /// Log level: DEBUG, INFO, WARNING, ERROR or CRITICAL (overrides config file)
    #[arg(long, env = "LOG_LEVEL", value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    /// Log format: text or json (overrides config file)
    #[arg(long, env = "LOG_FORMAT", value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Dataset directory (overrides config file)
    #[arg(long, env = "GPS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run a single collection cycle and exit
    #[arg(long)]
    once: bool,
}

impl Cli {
    /// Load the config file (if any), apply overrides (CLI > ENV > file) and validate.
    fn resolve(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::default(),
        };

        if let Some(account_id) = &self.account_id {
            config.api.account_id = account_id.clone();
        }
        if let Some(secret_key) = &self.secret_key {
            config.api.secret_key = secret_key.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api.api_key = api_key.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.api.base_url = base_url.clone();
        }
        if let Some(interval) = self.interval {
            config.collection.interval = interval;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(data_dir) = &self.data_dir {
            config.storage.data_dir = data_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("unknown log level '{s}' (expected DEBUG, INFO, WARNING, ERROR or CRITICAL)"))
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("unknown log format '{s}' (expected text or json)"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            telemetry::init(&LogConfig::default());
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    telemetry::init(&config.log);
    tracing::info!("GPS Collector - FleetUp vehicle location collector");
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    match run(config, cli.once).await {
        Ok(summary) => {
            tracing::info!(
                cycles = summary.cycles,
                written = summary.written,
                duplicates = summary.duplicates,
                failed = summary.failed,
                "Shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(CollectorError::Config(message)) => {
            tracing::error!(error = %message, "Invalid configuration");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            tracing::error!(error = %e, "Collector stopped on fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig, once: bool) -> Result<RunSummary, CollectorError> {
    tracing::info!(
        base_url = %config.api.base_url,
        interval_secs = config.collection.interval.as_secs(),
        data_dir = %config.storage.data_dir.display(),
        rotation = %config.storage.rotation,
        "Starting collector"
    );

    let storage = config.storage.builder().build()?;
    let client = Arc::new(FleetUpClient::new(config.api.clone())?);
    let mut scheduler = Scheduler::new(client, storage, config.collection.retry.policy())
        .with_run_immediately(config.collection.run_immediately);

    let (handle, stop) = stop_channel();
    tokio::spawn(shutdown_signal(handle));

    if once {
        return scheduler.run_once(stop).await;
    }
    tracing::info!("Press Ctrl+C to shutdown");
    scheduler.run(config.collection.interval, stop).await
}

/// Raise the stop signal on Ctrl+C or SIGTERM.
async fn shutdown_signal(handle: StopHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Stopping after the current step...");
    handle.stop();
}

use chart_export_server::{setup_logging, Cli, CliRunner, Commands, ExportConfig};
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting chart-export-server v{}", env!("CARGO_PKG_VERSION"));

    // Validation needs no browser; handle it before the service spins up.
    if let Commands::Validate { config } = &args.command {
        let content = tokio::fs::read_to_string(config).await?;
        let parsed: ExportConfig = serde_json::from_str(&content)?;
        parsed.validate()?;
        println!("Configuration {} is valid", config.display());
        return Ok(());
    }

    if args.metrics {
        chart_export_server::install_prometheus_recorder()?;
        info!("Prometheus metrics recorder installed");
    }

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Command completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.service.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("chart-export-server stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<ExportConfig, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        ExportConfig::default()
    };

    // CLI flags win over the file.
    if let Some(min_workers) = args.min_workers {
        config.pool.min_workers = min_workers;
    }
    if let Some(max_workers) = args.max_workers {
        config.pool.max_workers = max_workers;
    }
    if let Some(work_limit) = args.work_limit {
        config.pool.work_limit = work_limit;
    }
    if let Some(version) = &args.highcharts_version {
        config.highcharts.version = version.clone();
    }
    if args.force_fetch {
        config.highcharts.force_fetch = true;
    }
    if args.allow_code_execution {
        config.custom_logic.allow_code_execution = true;
    }
    if args.allow_file_resources {
        config.custom_logic.allow_file_resources = true;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }
    if let Some(timeout_ms) = args.timeout {
        config.export.rasterization_timeout = Duration::from_millis(timeout_ms);
    }

    config.validate()?;

    info!("Configuration loaded");
    info!("Library version: {}", config.highcharts.version);
    info!(
        "Pool: {}..{} workers, work limit {}",
        config.pool.min_workers, config.pool.max_workers, config.pool.work_limit
    );
    info!(
        "Rasterization timeout: {:?}",
        config.export.rasterization_timeout
    );

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        // Give the select! in main a moment to notice before hard exit.
        let _ = shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
    })
}

use crate::{
    format_bytes, format_duration, sanitize_filename, ExportConfig, ExportRequest,
    ExportResources, ExportResult, ExportService, HealthMonitor,
};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "chart-export-server")]
#[command(about = "Chart rendering service driving pooled headless Chrome pages")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Minimum pool workers")]
    pub min_workers: Option<usize>,

    #[arg(long, help = "Maximum pool workers")]
    pub max_workers: Option<usize>,

    #[arg(long, help = "Renders per worker before recycling")]
    pub work_limit: Option<usize>,

    #[arg(long, help = "Charting library version to pin")]
    pub highcharts_version: Option<String>,

    #[arg(long, help = "Refetch library scripts even when cached")]
    pub force_fetch: bool,

    #[arg(long, help = "Allow request-supplied code execution")]
    pub allow_code_execution: bool,

    #[arg(long, help = "Allow file paths in resources and custom code")]
    pub allow_file_resources: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Rasterization timeout in milliseconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Install the Prometheus metrics recorder")]
    pub metrics: bool,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export a single chart
    Single {
        #[arg(short, long, help = "Chart options JSON file")]
        options: Option<PathBuf>,

        #[arg(long, help = "Raw SVG file to rasterize instead of options")]
        svg: Option<PathBuf>,

        #[arg(short = 'o', long, help = "Output file path")]
        outfile: PathBuf,

        #[arg(short = 't', long, help = "Output type (png, jpeg, pdf, svg)")]
        r#type: Option<String>,

        #[arg(long, help = "Constructor (chart, stockChart, mapChart, ganttChart)")]
        constr: Option<String>,

        #[arg(long, help = "Chart width in pixels")]
        width: Option<f64>,

        #[arg(long, help = "Chart height in pixels")]
        height: Option<f64>,

        #[arg(long, help = "Scale factor, clamped to [0.1, 5.0]")]
        scale: Option<f64>,

        #[arg(long, help = "Global options JSON file applied via setOptions")]
        global_options: Option<PathBuf>,

        #[arg(long, help = "Resources JSON file ({js, css, files})")]
        resources: Option<PathBuf>,

        #[arg(long, help = "Constructor callback JS file")]
        callback: Option<PathBuf>,
    },

    /// Export a batch of requests, one JSON request per line
    Batch {
        #[arg(short, long, help = "Input file with one JSON request per line")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory")]
        output: PathBuf,

        #[arg(short, long, default_value = "4", help = "Concurrent exports")]
        concurrency: usize,
    },

    /// Show pool and export statistics
    Health {
        #[arg(long, help = "Show the full statistics breakdown")]
        detailed: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: ExportConfig,
    pub service: Arc<ExportService>,
}

impl CliRunner {
    pub async fn new(config: ExportConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let service = Arc::new(ExportService::new(config.clone()).await?);
        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Single {
                options,
                svg,
                outfile,
                r#type,
                constr,
                width,
                height,
                scale,
                global_options,
                resources,
                callback,
            } => {
                self.run_single(SingleOptions {
                    options,
                    svg,
                    outfile,
                    out_type: r#type,
                    constr,
                    width,
                    height,
                    scale,
                    global_options,
                    resources,
                    callback,
                })
                .await
            }
            Commands::Batch {
                input,
                output,
                concurrency,
            } => self.run_batch(input, output, concurrency).await,
            Commands::Health { detailed } => self.show_health(detailed).await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    async fn run_single(&self, options: SingleOptions) -> Result<(), Box<dyn std::error::Error>> {
        let request = self.build_request(&options).await?;
        info!(request = %request.request_id, "Exporting chart");

        let result = self.service.export(request).await?;
        write_output(&result, &options.outfile).await?;

        println!("Export complete:");
        println!("  Output: {}", options.outfile.display());
        println!("  Type: {}", result.mime_type);
        println!("  Size: {}", format_bytes(result.data.len()));
        println!("  Duration: {}", format_duration(result.elapsed));
        println!("  Worker: {}", result.produced_by);
        Ok(())
    }

    async fn build_request(
        &self,
        options: &SingleOptions,
    ) -> Result<ExportRequest, Box<dyn std::error::Error>> {
        let chart_options = match &options.options {
            Some(path) => Some(serde_json::from_str(&fs::read_to_string(path).await?)?),
            None => None,
        };
        let svg = match &options.svg {
            Some(path) => Some(fs::read_to_string(path).await?),
            None => None,
        };
        let global_options = match &options.global_options {
            Some(path) => Some(serde_json::from_str(&fs::read_to_string(path).await?)?),
            None => None,
        };
        let resources: Option<ExportResources> = match &options.resources {
            Some(path) => Some(serde_json::from_str(&fs::read_to_string(path).await?)?),
            None => None,
        };
        let callback = match &options.callback {
            Some(path) => Some(fs::read_to_string(path).await?),
            None => None,
        };

        Ok(ExportRequest {
            options: chart_options,
            svg,
            out_type: options.out_type.clone(),
            outfile: Some(options.outfile.to_string_lossy().to_string()),
            constr: options.constr.clone(),
            width: options.width,
            height: options.height,
            scale: options.scale,
            global_options,
            resources,
            callback,
            allow_code_execution: self.config.custom_logic.allow_code_execution,
            allow_file_resources: self.config.custom_logic.allow_file_resources,
            ..Default::default()
        })
    }

    async fn run_batch(
        &self,
        input: PathBuf,
        output: PathBuf,
        concurrency: usize,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = fs::read_to_string(&input).await?;
        let mut requests = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ExportRequest>(line) {
                Ok(mut request) => {
                    // Batch callers inherit the configured trust gates.
                    request.allow_code_execution = self.config.custom_logic.allow_code_execution;
                    request.allow_file_resources = self.config.custom_logic.allow_file_resources;
                    requests.push(request);
                }
                Err(e) => warn!(line = line_no + 1, "Skipping unparseable request: {}", e),
            }
        }

        info!(
            "Processing batch of {} requests from {}",
            requests.len(),
            input.display()
        );
        fs::create_dir_all(&output).await?;

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let tasks: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let service = self.service.clone();
                let semaphore = semaphore.clone();
                let output = output.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return false;
                    };
                    let request_id = request.request_id.clone();
                    let outfile = batch_outfile(&output, &request);
                    match service.export(request).await {
                        Ok(result) => match write_output(&result, &outfile).await {
                            Ok(()) => {
                                info!("Saved {}", outfile.display());
                                true
                            }
                            Err(e) => {
                                error!("Failed to write {}: {}", outfile.display(), e);
                                false
                            }
                        },
                        Err(e) => {
                            error!(request = %request_id, "Export failed: {}", e);
                            false
                        }
                    }
                })
            })
            .collect();

        let mut success = 0usize;
        let mut failed = 0usize;
        for task in tasks {
            match task.await {
                Ok(true) => success += 1,
                _ => failed += 1,
            }
        }

        let stats = self.service.stats();
        println!("Batch complete. Success: {success}, Errors: {failed}");
        println!(
            "  Attempts: {}, performed: {}, dropped: {}, average: {:.0}ms",
            stats.export_attempts,
            stats.performed_exports,
            stats.dropped_exports,
            stats.spent_average_ms
        );
        Ok(())
    }

    async fn show_health(&self, detailed: bool) -> Result<(), Box<dyn std::error::Error>> {
        let monitor = HealthMonitor::new(self.service.clone());
        let status = monitor.check().await;

        println!("System Health Check");
        println!("==================");
        println!("Overall: {:?}", status.overall);
        println!("Library version: {}", self.service.active_version().await);
        println!("Worker Pool:");
        println!("  Alive: {}", status.pool_stats.alive);
        println!("  Free: {}", status.pool_stats.free);
        println!("  In use: {}", status.pool_stats.in_use);

        if detailed {
            println!("  Created total: {}", status.pool_stats.created_total);
            println!("  Destroyed total: {}", status.pool_stats.destroyed_total);
            println!("  Recycled (work limit): {}", status.pool_stats.recycled);
            println!("  Reaped (idle): {}", status.pool_stats.reaped);
            println!("Exports:");
            println!("  Attempts: {}", status.export_stats.export_attempts);
            println!("  Performed: {}", status.export_stats.performed_exports);
            println!("  Dropped: {}", status.export_stats.dropped_exports);
            println!(
                "  From SVG: {}",
                status.export_stats.export_from_svg_attempts
            );
            println!(
                "  Time spent: {}",
                format_duration(status.export_stats.time_spent)
            );
            println!("  Average: {:.0}ms", status.export_stats.spent_average_ms);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SingleOptions {
    options: Option<PathBuf>,
    svg: Option<PathBuf>,
    outfile: PathBuf,
    out_type: Option<String>,
    constr: Option<String>,
    width: Option<f64>,
    height: Option<f64>,
    scale: Option<f64>,
    global_options: Option<PathBuf>,
    resources: Option<PathBuf>,
    callback: Option<PathBuf>,
}

fn batch_outfile(output_dir: &Path, request: &ExportRequest) -> PathBuf {
    if let Some(outfile) = &request.outfile {
        return output_dir.join(sanitize_filename(outfile));
    }
    let extension = crate::utils::normalize_output_type(
        request.out_type.as_deref(),
        None,
        crate::OutputType::Png,
    )
    .extension();
    output_dir.join(format!("{}.{}", request.request_id, extension))
}

/// Write one result to disk, decoding base64 payloads back to raw bytes.
async fn write_output(
    result: &ExportResult,
    outfile: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = outfile.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    if result.mime_type == "image/svg+xml" {
        fs::write(outfile, result.data.as_bytes()).await?;
    } else {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&result.data)?;
        fs::write(outfile, bytes).await?;
    }
    Ok(())
}

async fn validate_config_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration: {}", path.display());

    let content = fs::read_to_string(path).await?;
    let config: ExportConfig = serde_json::from_str(&content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Library version: {}", config.highcharts.version);
    println!("  CDN: {}", config.highcharts.cdn_url);
    println!(
        "  Pool: {}..{} workers, work limit {}",
        config.pool.min_workers, config.pool.max_workers, config.pool.work_limit
    );
    println!(
        "  Defaults: {}x{} @{}",
        config.export.default_width, config.export.default_height, config.export.default_scale
    );
    println!(
        "  Code execution: {}, file resources: {}",
        config.custom_logic.allow_code_execution, config.custom_logic.allow_file_resources
    );
    Ok(())
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

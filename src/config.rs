//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the export server:
//! asset pinning, pool sizing, export defaults, the custom-logic trust gates,
//! and browser launch options, plus the request/result records consumed and
//! produced by the dispatcher.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the export server
///
/// Sections map onto the subsystems that consume them: `highcharts` feeds the
/// asset cache, `pool` the worker pool, `export` the render protocol defaults,
/// `custom_logic` the code-execution trust gates, and `browser` the Chrome
/// launch.
///
/// # Examples
///
/// ```rust
/// use chart_export_server::ExportConfig;
///
/// // Use default configuration
/// let config = ExportConfig::default();
///
/// // Create custom configuration
/// let mut config = ExportConfig::default();
/// config.pool.max_workers = 4;
/// config.highcharts.version = "11.4.8".to_string();
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExportConfig {
    /// Charting library version, CDN, and cache settings
    #[serde(default)]
    pub highcharts: HighchartsConfig,

    /// Worker pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,

    /// Defaults applied to requests that omit size/type/constructor
    #[serde(default)]
    pub export: ExportDefaults,

    /// Trust gates for user-supplied code and file resources
    #[serde(default)]
    pub custom_logic: CustomLogicConfig,

    /// Browser process launch options
    #[serde(default)]
    pub browser: BrowserOptions,
}

impl ExportConfig {
    /// Basic sanity validation, called once at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.max_workers == 0 {
            return Err("pool.max_workers must be greater than 0".to_string());
        }
        if self.pool.work_limit == 0 {
            return Err("pool.work_limit must be greater than 0".to_string());
        }
        if self.export.default_width <= 0.0 || self.export.default_height <= 0.0 {
            return Err("export defaults must have positive dimensions".to_string());
        }
        if self.highcharts.version.is_empty() {
            return Err("highcharts.version must not be empty".to_string());
        }
        if self.highcharts.core_scripts.is_empty() {
            return Err("highcharts.core_scripts must not be empty".to_string());
        }
        Ok(())
    }
}

/// Charting library assets: pinned version, CDN base, and local cache
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HighchartsConfig {
    /// Pinned library version, or "latest" to track the CDN head
    pub version: String,

    /// CDN base URL; scripts resolve as `{cdn_url}/{version}/{name}.js`
    pub cdn_url: String,

    /// Refetch even when the cache directory already holds the scripts
    pub force_fetch: bool,

    /// Directory holding fetched scripts, `sources.js`, and the manifest
    pub cache_path: PathBuf,

    /// Core library scripts, loaded first and in order
    pub core_scripts: Vec<String>,

    /// Optional feature modules, loaded after the core
    pub module_scripts: Vec<String>,

    /// Technical-indicator scripts, loaded after the modules
    pub indicator_scripts: Vec<String>,

    /// User-declared absolute script URLs, loaded last
    pub custom_scripts: Vec<String>,
}

impl Default for HighchartsConfig {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            cdn_url: "https://code.highcharts.com".to_string(),
            force_fetch: false,
            cache_path: PathBuf::from(".cache"),
            core_scripts: vec![
                "highcharts.js".to_string(),
                "highcharts-more.js".to_string(),
                "highcharts-3d.js".to_string(),
            ],
            module_scripts: vec![
                "modules/stock.js".to_string(),
                "modules/map.js".to_string(),
                "modules/gantt.js".to_string(),
                "modules/exporting.js".to_string(),
                "modules/export-data.js".to_string(),
                "modules/accessibility.js".to_string(),
                "modules/annotations.js".to_string(),
                "modules/series-label.js".to_string(),
            ],
            indicator_scripts: vec!["indicators/indicators-all.js".to_string()],
            custom_scripts: Vec::new(),
        }
    }
}

/// Worker pool sizing and timeout configuration
///
/// `min_workers` pages are created at init and kept alive by the reaper;
/// demand beyond that creates pages lazily up to `max_workers`. A page is
/// destroyed once it has performed `work_limit` renders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pages created at init and protected from idle reaping (default: 4)
    pub min_workers: usize,

    /// Upper bound on concurrently existing pages (default: CPU count)
    pub max_workers: usize,

    /// Renders a single page performs before being recycled (default: 40)
    pub work_limit: usize,

    /// How long an acquire waits for a free page before failing (default: 5s)
    pub acquire_timeout: Duration,

    /// Total budget for creating one page, across retries (default: 5s)
    pub create_timeout: Duration,

    /// Budget for closing a page before it is abandoned (default: 5s)
    pub destroy_timeout: Duration,

    /// Idle age beyond which the reaper destroys a free page (default: 30s)
    pub idle_timeout: Duration,

    /// Delay between page-creation retries (default: 200ms)
    pub create_retry_interval: Duration,

    /// How often the reaper scans the free set (default: 1s)
    pub reaper_interval: Duration,

    /// Emit per-acquire timing logs (default: false)
    pub benchmarking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: num_cpus::get().max(4),
            work_limit: 40,
            acquire_timeout: Duration::from_secs(5),
            create_timeout: Duration::from_secs(5),
            destroy_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            create_retry_interval: Duration::from_millis(200),
            reaper_interval: Duration::from_secs(1),
            benchmarking: false,
        }
    }
}

impl PoolConfig {
    /// Clamp `min_workers` down to `max_workers` when misconfigured.
    pub fn normalized(mut self) -> Self {
        if self.min_workers > self.max_workers {
            tracing::warn!(
                "pool.min_workers ({}) exceeds pool.max_workers ({}), clamping",
                self.min_workers,
                self.max_workers
            );
            self.min_workers = self.max_workers;
        }
        self
    }
}

/// Defaults consumed by the render protocol for under-specified requests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportDefaults {
    /// Output type when the request names none (default: png)
    #[serde(rename = "type")]
    pub out_type: OutputType,

    /// Chart constructor when the request names none (default: chart)
    pub constr: ChartConstructor,

    /// Fallback chart width in CSS pixels (default: 600)
    pub default_width: f64,

    /// Fallback chart height in CSS pixels (default: 400)
    pub default_height: f64,

    /// Fallback device scale factor (default: 1.0)
    pub default_scale: f64,

    /// Deadline for a chart to reach a stable SVG (default: 1500ms)
    ///
    /// The source project ships a tight 1.5s default; raise this for large
    /// maps or dense stock charts.
    pub rasterization_timeout: Duration,
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            out_type: OutputType::Png,
            constr: ChartConstructor::Chart,
            default_width: 600.0,
            default_height: 400.0,
            default_scale: 1.0,
            rasterization_timeout: Duration::from_millis(1500),
        }
    }
}

/// Trust gates for user-supplied code
///
/// Both default to off. `allow_code_execution` gates the custom-code hook and
/// constructor callbacks; `allow_file_resources` gates filesystem reads for
/// injected resources and `.js` custom-code files. These are a trust
/// boundary: only enable them for deployments whose callers are trusted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomLogicConfig {
    /// Evaluate request-supplied `custom_code` and `callback` (default: false)
    pub allow_code_execution: bool,

    /// Honor local file paths in resources and custom code (default: false)
    pub allow_file_resources: bool,
}

/// Headless flavor passed to Chrome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadlessMode {
    /// Full headless (`--headless`)
    New,
    /// The lighter `--headless=shell` mode
    Shell,
}

/// Browser process launch options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserOptions {
    /// Extra Chrome command-line arguments appended after the built-in set
    pub args: Vec<String>,

    /// Headless flavor (default: full headless)
    pub headless_mode: HeadlessMode,

    /// Path to the Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Fixed remote debugging port (default: derived from instance id)
    pub debug_port: Option<u16>,

    /// Artificial delay inserted between protocol steps, for debugging
    pub slow_mo: Option<u64>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            headless_mode: HeadlessMode::New,
            chrome_path: None,
            debug_port: None,
            slow_mo: None,
        }
    }
}

/// Supported output types
///
/// `pdf` and `svg` payloads are UTF-8 internally; `png` and `jpeg` payloads
/// are base64 from the moment they are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Png,
    Jpeg,
    Pdf,
    Svg,
}

impl OutputType {
    /// Parse a user-supplied type name. `jpg` is accepted as `jpeg`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(OutputType::Png),
            "jpeg" | "jpg" => Some(OutputType::Jpeg),
            "pdf" => Some(OutputType::Pdf),
            "svg" => Some(OutputType::Svg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputType::Png => "image/png",
            OutputType::Jpeg => "image/jpeg",
            OutputType::Pdf => "application/pdf",
            OutputType::Svg => "image/svg+xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputType::Png => "png",
            OutputType::Jpeg => "jpeg",
            OutputType::Pdf => "pdf",
            OutputType::Svg => "svg",
        }
    }

    /// Raster targets are the only ones the scale factor applies to.
    pub fn is_raster(&self) -> bool {
        matches!(self, OutputType::Png | OutputType::Jpeg)
    }
}

/// The charting library entry point used to construct a chart
///
/// Unknown names are rejected at parse time rather than silently defaulting;
/// the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChartConstructor {
    Chart,
    StockChart,
    MapChart,
    GanttChart,
}

impl ChartConstructor {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "chart" => Some(ChartConstructor::Chart),
            "stockChart" => Some(ChartConstructor::StockChart),
            "mapChart" => Some(ChartConstructor::MapChart),
            "ganttChart" => Some(ChartConstructor::GanttChart),
            _ => None,
        }
    }

    /// The property name on the in-page `Highcharts` object.
    pub fn js_name(&self) -> &'static str {
        match self {
            ChartConstructor::Chart => "chart",
            ChartConstructor::StockChart => "stockChart",
            ChartConstructor::MapChart => "mapChart",
            ChartConstructor::GanttChart => "ganttChart",
        }
    }
}

/// User-declared per-request resources injected into the page
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExportResources {
    /// Inline JavaScript appended as one `<script>` tag
    pub js: Option<String>,

    /// CSS; `@import url(...)` entries are expanded, the rest is one `<style>`
    pub css: Option<String>,

    /// Local file paths (JS/CSS), honored only with `allow_file_resources`
    #[serde(default)]
    pub files: Vec<String>,
}

impl ExportResources {
    pub fn is_empty(&self) -> bool {
        self.js.is_none() && self.css.is_none() && self.files.is_empty()
    }
}

/// One render request as consumed by the dispatcher
///
/// Exactly one of `options` / `svg` must be present; shapes inside `options`
/// are opaque to the server and interpreted by the charting library alone.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportRequest {
    /// Correlation id, generated when the caller provides none
    #[serde(default = "generated_request_id")]
    pub request_id: String,

    /// Chart options tree, passed verbatim to the in-page constructor
    pub options: Option<serde_json::Value>,

    /// Raw SVG to rasterize instead of constructing a chart
    pub svg: Option<String>,

    /// Requested output type name (`png`, `jpeg`/`jpg`, `pdf`, `svg`)
    #[serde(rename = "type")]
    pub out_type: Option<String>,

    /// Output filename; its extension wins over an inconsistent `type`
    pub outfile: Option<String>,

    /// Constructor name; unknown names are rejected
    pub constr: Option<String>,

    /// Explicit chart width in CSS pixels
    pub width: Option<f64>,

    /// Explicit chart height in CSS pixels
    pub height: Option<f64>,

    /// Device scale factor, clamped to `[0.1, 5.0]`
    pub scale: Option<f64>,

    /// Options installed via `setOptions` before the chart is built
    pub global_options: Option<serde_json::Value>,

    /// Theme options, merged over `global_options`
    pub theme_options: Option<serde_json::Value>,

    /// User code evaluated before chart construction (gated)
    pub custom_code: Option<String>,

    /// Constructor callback source (gated)
    pub callback: Option<String>,

    /// Per-request JS/CSS/file resources
    pub resources: Option<ExportResources>,

    /// Evaluate `custom_code`/`callback` for this request
    #[serde(default)]
    pub allow_code_execution: bool,

    /// Honor file paths in `resources`/`custom_code` for this request
    #[serde(default)]
    pub allow_file_resources: bool,

    /// Per-request override of the rasterization deadline
    pub rasterization_timeout: Option<Duration>,
}

fn generated_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            request_id: generated_request_id(),
            options: None,
            svg: None,
            out_type: None,
            outfile: None,
            constr: None,
            width: None,
            height: None,
            scale: None,
            global_options: None,
            theme_options: None,
            custom_code: None,
            callback: None,
            resources: None,
            allow_code_execution: false,
            allow_file_resources: false,
            rasterization_timeout: None,
        }
    }
}

/// One render result as produced by the dispatcher
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub request_id: String,
    /// Base64 for png/jpeg/pdf, UTF-8 for svg
    pub data: String,
    pub mime_type: &'static str,
    /// Id of the page resource that produced the output
    pub produced_by: uuid::Uuid,
    pub elapsed: Duration,
}

/// Backoff schedule for asset fetching
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use chart_export_server::{ExportConfig, get_chrome_args};
///
/// let config = ExportConfig::default();
/// let args = get_chrome_args(&config.browser);
/// assert!(args.iter().any(|a| a.starts_with("--headless")));
/// ```
pub fn get_chrome_args(options: &BrowserOptions) -> Vec<String> {
    get_chrome_args_with_instance_id(options, None)
}

/// Generate Chrome arguments with a unique instance id
///
/// Each launched browser gets its own user-data and temp directories and its
/// own debugging port; Chrome's profile-level singleton lock otherwise
/// rejects concurrent processes.
pub fn get_chrome_args_with_instance_id(
    options: &BrowserOptions,
    instance_id: Option<usize>,
) -> Vec<String> {
    let unique_id = match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    };

    let headless_arg = match options.headless_mode {
        HeadlessMode::New => "--headless".to_string(),
        HeadlessMode::Shell => "--headless=shell".to_string(),
    };

    let debug_port = options
        .debug_port
        .map(|p| p as usize + instance_id.unwrap_or(0))
        .unwrap_or(9222 + instance_id.unwrap_or(0));

    let mut args = vec![
        headless_arg,
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!("--user-data-dir=/tmp/chart-export-{unique_id}"),
        format!("--remote-debugging-port={debug_port}"),
    ];

    args.extend(options.args.iter().cloned());
    args
}

pub fn create_browser_config(options: &BrowserOptions) -> chromiumoxide::browser::BrowserConfig {
    create_browser_config_with_instance_id(options, None)
}

pub fn create_browser_config_with_instance_id(
    options: &BrowserOptions,
    instance_id: Option<usize>,
) -> chromiumoxide::browser::BrowserConfig {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder =
        BrowserConfig::builder().args(get_chrome_args_with_instance_id(options, instance_id));

    if let Some(chrome_path) = &options.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .unwrap_or_else(|_| BrowserConfig::with_executable("/usr/bin/chromium"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ExportConfig::default();
        assert_eq!(config.pool.work_limit, 40);
        assert_eq!(config.export.default_width, 600.0);
        assert_eq!(config.export.default_height, 400.0);
        assert_eq!(
            config.export.rasterization_timeout,
            Duration::from_millis(1500)
        );
        assert!(!config.custom_logic.allow_code_execution);
        assert!(!config.custom_logic.allow_file_resources);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_normalized_clamps_min() {
        let pool = PoolConfig {
            min_workers: 16,
            max_workers: 4,
            ..Default::default()
        }
        .normalized();
        assert_eq!(pool.min_workers, 4);
        assert_eq!(pool.max_workers, 4);
    }

    #[test]
    fn test_pool_config_normalized_keeps_valid() {
        let pool = PoolConfig {
            min_workers: 2,
            max_workers: 8,
            ..Default::default()
        }
        .normalized();
        assert_eq!(pool.min_workers, 2);
    }

    #[test]
    fn test_output_type_parse() {
        assert_eq!(OutputType::parse("png"), Some(OutputType::Png));
        assert_eq!(OutputType::parse("jpg"), Some(OutputType::Jpeg));
        assert_eq!(OutputType::parse("JPEG"), Some(OutputType::Jpeg));
        assert_eq!(OutputType::parse("pdf"), Some(OutputType::Pdf));
        assert_eq!(OutputType::parse("svg"), Some(OutputType::Svg));
        assert_eq!(OutputType::parse("webp"), None);
    }

    #[test]
    fn test_constructor_parse_rejects_unknown() {
        assert_eq!(ChartConstructor::parse("chart"), Some(ChartConstructor::Chart));
        assert_eq!(
            ChartConstructor::parse("stockChart"),
            Some(ChartConstructor::StockChart)
        );
        assert_eq!(ChartConstructor::parse("Chart"), None);
        assert_eq!(ChartConstructor::parse("pieChart"), None);
    }

    #[test]
    fn test_chrome_args_generation() {
        let options = BrowserOptions::default();
        let args = get_chrome_args(&options);

        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));
    }

    #[test]
    fn test_chrome_args_shell_mode() {
        let options = BrowserOptions {
            headless_mode: HeadlessMode::Shell,
            ..Default::default()
        };
        let args = get_chrome_args(&options);
        assert!(args.contains(&"--headless=shell".to_string()));
    }

    #[test]
    fn test_chrome_args_extra_args_appended() {
        let options = BrowserOptions {
            args: vec!["--lang=de".to_string()],
            ..Default::default()
        };
        let args = get_chrome_args(&options);
        assert!(args.contains(&"--lang=de".to_string()));
    }

    #[test]
    fn test_request_default() {
        let request = ExportRequest::default();
        assert!(!request.request_id.is_empty());
        assert!(request.options.is_none());
        assert!(request.svg.is_none());
        assert!(!request.allow_code_execution);
        assert!(request.rasterization_timeout.is_none());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = ExportConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ExportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool.work_limit, config.pool.work_limit);
        assert_eq!(back.highcharts.cdn_url, config.highcharts.cdn_url);
        assert_eq!(back.export.out_type, OutputType::Png);
    }
}

//! # Chart Export Server
//!
//! A chart rendering service written in Rust: declarative chart descriptions
//! (a Highcharts options object) or raw SVG go in, PNG/JPEG/PDF/SVG bytes
//! come out. Rendering happens in a bounded pool of headless Chrome pages,
//! each pre-seeded with a cached copy of the charting library, driven over
//! the Chrome DevTools Protocol.
//!
//! ## Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | Asset cache | [`assets`] | Fetch, concatenate, and memoize the library scripts for a pinned version |
//! | Browser supervisor | [`browser`] | Own the Chrome process; reconnect or relaunch on disconnect |
//! | Page resource | [`page`] | A reusable tab with the library installed; soft and hard resets |
//! | Worker pool | [`pool`] | Bounded FIFO pool with work-limit recycling and idle reaping |
//! | Render protocol | [`render`] | The fixed per-lease sequence from request to output bytes |
//! | Dispatcher | [`service`] | `export(request) -> result`, deadlines, stats, error routing |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chart_export_server::{ExportConfig, ExportRequest, ExportService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ExportService::new(ExportConfig::default()).await?;
//!
//!     let request = ExportRequest {
//!         options: Some(serde_json::json!({
//!             "title": {"text": "Chart"},
//!             "xAxis": {"categories": ["Jan", "Feb", "Mar"]},
//!             "series": [{"data": [29.9, 71.5, 106.4]}]
//!         })),
//!         ..Default::default()
//!     };
//!     let result = service.export(request).await?;
//!     println!("Exported {} bytes as {}", result.data.len(), result.mime_type);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # Single export
//! chart-export-server single --options chart.json --outfile chart.png
//!
//! # Batch of requests, one JSON object per line
//! chart-export-server batch --input requests.jsonl --output out/ --concurrency 8
//! ```
//!
//! ## Trust boundary
//!
//! Request-supplied `custom_code` and constructor callbacks are evaluated
//! inside the page only when code execution is explicitly enabled, and file
//! resources are read only when file access is explicitly enabled. Both
//! default to off.

/// Configuration records, request/result types, and Chrome launch arguments
pub mod config;

/// Error taxonomy and classification helpers
pub mod error;

/// Charting library asset cache
pub mod assets;

/// Browser process supervision
pub mod browser;

/// Reusable page resources and per-request resource injection
pub mod page;

/// Bounded worker pool with recycling and reaping
pub mod pool;

/// The per-lease render protocol
pub mod render;

/// The export service and dispatcher
pub mod service;

/// Export statistics and metrics instruments
pub mod stats;

/// Health checking over pool and export statistics
pub mod health;

/// Command-line interface implementation
pub mod cli;

/// Output normalization, address screening, and formatting helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use assets::*;
pub use browser::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use page::*;
pub use pool::*;
pub use render::*;
pub use service::*;
pub use stats::*;
pub use utils::*;

//! Charting library asset cache
//!
//! Fetches, concatenates, and memoizes the charting library for a pinned
//! version: core scripts, feature modules, indicators, and user-declared
//! custom script URLs, in that order. The concatenation order is the in-page
//! load order; reordering changes library behavior and is never done.
//!
//! The active bundle is shared immutably and replaced atomically; version
//! changes re-run the full fetch and only publish on success.

use crate::{ExportError, HighchartsConfig, RetryConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// An immutable, fully assembled script bundle for one library version
#[derive(Debug, Clone)]
pub struct AssetBundle {
    /// Resolved version string (configured literal, or the banner version
    /// when tracking "latest")
    pub version: String,
    /// All scripts concatenated in load order
    pub script_blob: String,
    /// Ordered script identifiers making up the blob
    pub manifest: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// On-disk manifest persisted next to the cached scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: String,
    pub fetched_at: DateTime<Utc>,
    pub scripts: Vec<String>,
}

/// Memoizing asset cache with atomic bundle replacement
pub struct AssetCache {
    config: HighchartsConfig,
    client: reqwest::Client,
    retry: RetryConfig,
    active: RwLock<Arc<AssetBundle>>,
    // updateVersion is serialized with itself; renders only take the read lock
    update_lock: Mutex<()>,
}

impl AssetCache {
    /// Build the cache and assemble the initial bundle. A fetch failure here
    /// is fatal: no bundle is ever published partially.
    pub async fn initialize(config: HighchartsConfig) -> Result<Self, ExportError> {
        let client = reqwest::Client::new();
        let retry = RetryConfig::default();
        let bundle = assemble_bundle(&config, &client, &retry).await?;

        info!(
            version = %bundle.version,
            scripts = bundle.manifest.len(),
            "Asset bundle ready"
        );

        Ok(Self {
            config,
            client,
            retry,
            active: RwLock::new(Arc::new(bundle)),
            update_lock: Mutex::new(()),
        })
    }

    /// The active bundle. Cheap; renders call this once per acquire.
    pub async fn current(&self) -> Arc<AssetBundle> {
        self.active.read().await.clone()
    }

    /// Re-pin to `new_version`, refetch, and atomically publish the new
    /// bundle. On failure the previous bundle stays active.
    pub async fn update_version(&self, new_version: &str) -> Result<Arc<AssetBundle>, ExportError> {
        let _guard = self.update_lock.lock().await;

        let mut config = self.config.clone();
        config.version = new_version.to_string();
        config.force_fetch = true;

        let bundle = Arc::new(assemble_bundle(&config, &self.client, &self.retry).await?);

        {
            let mut active = self.active.write().await;
            *active = bundle.clone();
        }

        info!(version = %bundle.version, "Asset bundle replaced");
        Ok(bundle)
    }
}

/// The ordered script list: core, modules, indicators, then custom URLs.
pub fn script_list(config: &HighchartsConfig) -> Vec<String> {
    config
        .core_scripts
        .iter()
        .chain(config.module_scripts.iter())
        .chain(config.indicator_scripts.iter())
        .chain(config.custom_scripts.iter())
        .cloned()
        .collect()
}

/// Resolve the fetch URL for one script entry. Custom entries are already
/// absolute; CDN entries are versioned unless tracking "latest".
pub fn script_url(config: &HighchartsConfig, name: &str) -> String {
    if name.starts_with("http://") || name.starts_with("https://") {
        return name.to_string();
    }
    let base = config.cdn_url.trim_end_matches('/');
    if config.version == "latest" {
        format!("{base}/{name}")
    } else {
        format!("{}/{}/{}", base, config.version, name)
    }
}

/// The cache filename for one script entry (path separators flattened).
pub fn cache_file_name(name: &str) -> String {
    let stripped = name
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped.replace(['/', ':'], "_")
}

/// Extract the `Highcharts JS v<n.n.n>` banner version from the core script.
pub fn parse_version_banner(blob: &str) -> Option<String> {
    let idx = blob.find("Highcharts JS v")?;
    let rest = &blob[idx + "Highcharts JS v".len()..];
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.split('.').count() >= 2 {
        Some(version)
    } else {
        None
    }
}

async fn assemble_bundle(
    config: &HighchartsConfig,
    client: &reqwest::Client,
    retry: &RetryConfig,
) -> Result<AssetBundle, ExportError> {
    let scripts = script_list(config);
    if scripts.is_empty() {
        return Err(ExportError::ConfigurationError(
            "no scripts configured".to_string(),
        ));
    }

    tokio::fs::create_dir_all(&config.cache_path).await?;

    let mut blob = String::new();
    for name in &scripts {
        let content = load_script(config, client, retry, name).await?;
        blob.push_str(&content);
        blob.push_str(";\n");
    }

    let version = if config.version == "latest" {
        parse_version_banner(&blob).unwrap_or_else(|| config.version.clone())
    } else {
        config.version.clone()
    };

    let fetched_at = Utc::now();
    persist_bundle(&config.cache_path, &version, fetched_at, &scripts, &blob).await?;

    Ok(AssetBundle {
        version,
        script_blob: blob,
        manifest: scripts,
        fetched_at,
    })
}

async fn load_script(
    config: &HighchartsConfig,
    client: &reqwest::Client,
    retry: &RetryConfig,
    name: &str,
) -> Result<String, ExportError> {
    let cache_file = config.cache_path.join(cache_file_name(name));

    if !config.force_fetch {
        if let Ok(content) = tokio::fs::read_to_string(&cache_file).await {
            debug!(script = name, "Loaded from cache");
            return Ok(content);
        }
    }

    let url = script_url(config, name);
    let content = fetch_with_backoff(client, retry, &url).await?;
    tokio::fs::write(&cache_file, &content).await?;
    debug!(script = name, url = %url, "Fetched and cached");
    Ok(content)
}

async fn fetch_with_backoff(
    client: &reqwest::Client,
    retry: &RetryConfig,
    url: &str,
) -> Result<String, ExportError> {
    let mut delay = retry.initial_delay;
    let mut last_error = None;

    for attempt in 1..=retry.max_attempts {
        match fetch_once(client, url).await {
            Ok(content) => return Ok(content),
            Err(e) => {
                warn!(
                    url,
                    attempt,
                    max_attempts = retry.max_attempts,
                    error = %e,
                    "Script fetch failed"
                );
                last_error = Some(e);
                if attempt < retry.max_attempts {
                    sleep(delay).await;
                    let next = delay.as_secs_f64() * retry.multiplier;
                    delay = std::time::Duration::from_secs_f64(next)
                        .min(retry.max_delay);
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ExportError::AssetFetchFailed(format!("no attempts made for {url}"))))
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<String, ExportError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ExportError::AssetFetchFailed(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }
    Ok(response.text().await?)
}

async fn persist_bundle(
    cache_path: &Path,
    version: &str,
    fetched_at: DateTime<Utc>,
    scripts: &[String],
    blob: &str,
) -> Result<(), ExportError> {
    tokio::fs::write(cache_path.join("sources.js"), blob).await?;

    let manifest = CacheManifest {
        version: version.to_string(),
        fetched_at,
        scripts: scripts.to_vec(),
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(cache_path.join("manifest.json"), manifest_json).await?;
    Ok(())
}

/// Read a previously persisted manifest, if any.
pub async fn read_manifest(cache_path: &PathBuf) -> Option<CacheManifest> {
    let content = tokio::fs::read_to_string(cache_path.join("manifest.json"))
        .await
        .ok()?;
    serde_json::from_str(&content).ok()
}

//! Reusable page resources
//!
//! A page resource is one browser tab pre-seeded with the HTML shell and the
//! active asset bundle. Between renders the page is soft-reset (charts
//! destroyed, shell DOM restored); after errors that may have corrupted page
//! JS state it is hard-reset (navigate to about:blank, reinstall the bundle).
//! Per-request JS/CSS/file resources are injected with recorded element ids
//! and disposed through those handles, never by scanning the DOM.

use crate::{AssetBundle, ExportError, ExportResources};
use chromiumoxide::cdp::browser_protocol::page::EventFrameDetached;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// The fixed HTML shell; exactly one chart container element.
pub const PAGE_SHELL: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  html, body { margin: 0; padding: 0; }
  #container { display: block; box-sizing: border-box; }
</style>
</head>
<body>
<div id="container"></div>
</body>
</html>"#;

/// Animation-disabling stub evaluated right after the bundle. Charts must
/// reach their final geometry synchronously with construction.
const ANIMATION_DISABLE_JS: &str = r#"(function () {
  if (typeof Highcharts === 'undefined') { return; }
  Highcharts.animObject = function () { return { duration: 0 }; };
  Highcharts.setOptions({
    chart: { animation: false, forExport: true },
    plotOptions: { series: { animation: false, dataLabels: { defer: false } } }
  });
})()"#;

/// Destroys registered charts and restores the shell body. Idempotent.
const SOFT_RESET_JS: &str = r#"(function () {
  if (window.Highcharts && Highcharts.charts) {
    for (var i = 0; i < Highcharts.charts.length; i++) {
      var chart = Highcharts.charts[i];
      if (chart) { chart.destroy(); }
    }
  }
  document.body.innerHTML = '<div id="container"></div>';
})()"#;

/// Opaque handle to one injected resource tag
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub element_id: String,
}

/// A single reusable tab plus its pool bookkeeping
pub struct PageResource {
    pub id: Uuid,
    pub page: Page,
    pub work_count: usize,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Version of the bundle installed on this page; the pool destroys
    /// resources whose version no longer matches the active bundle.
    pub bundle_version: String,
    healthy: Arc<AtomicBool>,
    detach_watcher: tokio::task::JoinHandle<()>,
}

impl PageResource {
    /// Wrap a fresh tab: install the shell and bundle, then watch for main
    /// frame detachment, which permanently invalidates the resource.
    /// The tab is closed again when setup fails partway.
    pub async fn new(page: Page, bundle: &AssetBundle) -> Result<Self, ExportError> {
        if let Err(e) = setup_page(&page, bundle).await {
            let _ = page.close().await;
            return Err(e);
        }

        let id = Uuid::new_v4();
        let healthy = Arc::new(AtomicBool::new(true));
        let detach_watcher = match spawn_detach_watcher(&page, id, healthy.clone()).await {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = page.close().await;
                return Err(e);
            }
        };

        debug!(worker = %id, "Page resource ready");
        Ok(Self {
            id,
            page,
            work_count: 0,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            bundle_version: bundle.version.clone(),
            healthy,
            detach_watcher,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn mark_used(&mut self) {
        self.work_count += 1;
        self.last_used_at = Instant::now();
    }

    pub fn idle_time(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }

    /// Restore the shell DOM and destroy charts; the bundle stays installed.
    pub async fn soft_reset(&self) -> Result<(), ExportError> {
        self.page
            .evaluate(SOFT_RESET_JS)
            .await
            .map_err(|e| ExportError::PageError(e.to_string()))?;
        Ok(())
    }

    /// Navigate away and reinstall the bundle from scratch. Used when page
    /// JS state may be corrupt.
    pub async fn hard_reset(&mut self, bundle: &AssetBundle) -> Result<(), ExportError> {
        self.page
            .goto("about:blank")
            .await
            .map_err(|e| ExportError::PageError(e.to_string()))?;
        setup_page(&self.page, bundle).await?;
        self.bundle_version = bundle.version.clone();
        Ok(())
    }

    /// Inject per-request resources. Individual failures are logged and
    /// skipped; the handles returned cover what was actually injected.
    pub async fn inject_resources(
        &self,
        resources: &ExportResources,
        allow_file_resources: bool,
    ) -> Vec<ResourceHandle> {
        let mut handles = Vec::new();

        if let Some(css) = &resources.css {
            let (imports, rest) = split_css_imports(css);

            for import in imports {
                let result = if is_url(&import) {
                    self.inject_link_tag(&import).await
                } else if allow_file_resources {
                    match tokio::fs::read_to_string(&import).await {
                        Ok(content) => self.inject_style_tag(&content).await,
                        Err(e) => Err(ExportError::ResourceInjectionFailed(format!(
                            "css import {import}: {e}"
                        ))),
                    }
                } else {
                    warn!(path = %import, "File CSS import skipped, allow_file_resources is off");
                    continue;
                };
                record_handle(result, &mut handles);
            }

            if !rest.trim().is_empty() {
                record_handle(self.inject_style_tag(&rest).await, &mut handles);
            }
        }

        if let Some(js) = &resources.js {
            record_handle(self.inject_script_tag(js).await, &mut handles);
        }

        for file in &resources.files {
            if is_url(file) {
                record_handle(self.inject_remote_script_tag(file).await, &mut handles);
                continue;
            }
            if !allow_file_resources {
                warn!(path = %file, "File resource skipped, allow_file_resources is off");
                continue;
            }
            let result = match tokio::fs::read_to_string(file).await {
                Ok(content) if file.ends_with(".css") => self.inject_style_tag(&content).await,
                Ok(content) => self.inject_script_tag(&content).await,
                Err(e) => Err(ExportError::ResourceInjectionFailed(format!(
                    "file {file}: {e}"
                ))),
            };
            record_handle(result, &mut handles);
        }

        handles
    }

    async fn inject_script_tag(&self, source: &str) -> Result<ResourceHandle, ExportError> {
        let element_id = resource_element_id();
        let expr = format!(
            r#"(function (id, src) {{
  var el = document.createElement('script');
  el.id = id;
  el.textContent = src;
  document.head.appendChild(el);
}})({}, {})"#,
            js_string(&element_id),
            js_string(source)
        );
        self.eval_injection(&expr).await?;
        Ok(ResourceHandle { element_id })
    }

    async fn inject_remote_script_tag(&self, url: &str) -> Result<ResourceHandle, ExportError> {
        let element_id = resource_element_id();
        let expr = format!(
            r#"(function (id, url) {{
  var el = document.createElement('script');
  el.id = id;
  el.src = url;
  document.head.appendChild(el);
}})({}, {})"#,
            js_string(&element_id),
            js_string(url)
        );
        self.eval_injection(&expr).await?;
        Ok(ResourceHandle { element_id })
    }

    async fn inject_style_tag(&self, css: &str) -> Result<ResourceHandle, ExportError> {
        let element_id = resource_element_id();
        let expr = format!(
            r#"(function (id, css) {{
  var el = document.createElement('style');
  el.id = id;
  el.textContent = css;
  document.head.appendChild(el);
}})({}, {})"#,
            js_string(&element_id),
            js_string(css)
        );
        self.eval_injection(&expr).await?;
        Ok(ResourceHandle { element_id })
    }

    async fn inject_link_tag(&self, url: &str) -> Result<ResourceHandle, ExportError> {
        let element_id = resource_element_id();
        let expr = format!(
            r#"(function (id, url) {{
  var el = document.createElement('link');
  el.id = id;
  el.rel = 'stylesheet';
  el.href = url;
  document.head.appendChild(el);
}})({}, {})"#,
            js_string(&element_id),
            js_string(url)
        );
        self.eval_injection(&expr).await?;
        Ok(ResourceHandle { element_id })
    }

    async fn eval_injection(&self, expr: &str) -> Result<(), ExportError> {
        self.page
            .evaluate(expr)
            .await
            .map_err(|e| ExportError::ResourceInjectionFailed(e.to_string()))?;
        Ok(())
    }

    /// Remove injected tags through their recorded element ids.
    pub async fn dispose_resources(&self, handles: &[ResourceHandle]) {
        for handle in handles {
            let expr = format!(
                r#"(function (id) {{
  var el = document.getElementById(id);
  if (el && el.parentNode) {{ el.parentNode.removeChild(el); }}
}})({})"#,
                js_string(&handle.element_id)
            );
            if let Err(e) = self.page.evaluate(expr).await {
                warn!(element = %handle.element_id, "Resource disposal failed: {}", e);
            }
        }
    }

    /// Close the underlying tab and stop the detach watcher.
    pub async fn close(self) {
        self.detach_watcher.abort();
        if let Err(e) = self.page.close().await {
            debug!(worker = %self.id, "Page close failed: {}", e);
        }
    }
}

/// Load the shell, install the bundle, and disable animations. After this
/// the page is idle and ready for a render.
pub async fn setup_page(page: &Page, bundle: &AssetBundle) -> Result<(), ExportError> {
    page.set_content(PAGE_SHELL)
        .await
        .map_err(|e| ExportError::PageError(e.to_string()))?;

    page.evaluate(bundle.script_blob.as_str())
        .await
        .map_err(|e| ExportError::PageError(format!("bundle install: {e}")))?;

    page.evaluate(ANIMATION_DISABLE_JS)
        .await
        .map_err(|e| ExportError::PageError(format!("animation stub: {e}")))?;

    Ok(())
}

async fn spawn_detach_watcher(
    page: &Page,
    id: Uuid,
    healthy: Arc<AtomicBool>,
) -> Result<tokio::task::JoinHandle<()>, ExportError> {
    let mut events = page
        .event_listener::<EventFrameDetached>()
        .await
        .map_err(|e| ExportError::PageError(e.to_string()))?;

    Ok(tokio::spawn(async move {
        if events.next().await.is_some() {
            warn!(worker = %id, "Main frame detached, marking resource unhealthy");
            healthy.store(false, Ordering::Relaxed);
        }
    }))
}

fn record_handle(result: Result<ResourceHandle, ExportError>, handles: &mut Vec<ResourceHandle>) {
    match result {
        Ok(handle) => handles.push(handle),
        Err(e) => warn!("Resource injection failed: {}", e),
    }
}

fn resource_element_id() -> String {
    format!("export-res-{}", Uuid::new_v4())
}

/// Encode arbitrary text as a JS string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Split CSS into `@import url(...)` targets and the remaining stylesheet.
pub fn split_css_imports(css: &str) -> (Vec<String>, String) {
    let mut imports = Vec::new();
    let mut rest = String::new();

    for line in css.lines() {
        let trimmed = line.trim();
        if let Some(target) = parse_import_line(trimmed) {
            imports.push(target);
        } else {
            rest.push_str(line);
            rest.push('\n');
        }
    }

    (imports, rest)
}

fn parse_import_line(line: &str) -> Option<String> {
    let rest = line.strip_prefix("@import")?.trim();
    let inner = if let Some(url_part) = rest.strip_prefix("url(") {
        url_part.split(')').next()?
    } else {
        rest.trim_end_matches(';')
    };
    let target = inner
        .trim()
        .trim_end_matches(';')
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_has_single_container() {
        assert_eq!(PAGE_SHELL.matches("id=\"container\"").count(), 1);
    }

    #[test]
    fn test_split_css_imports_url_form() {
        let css = "@import url(\"https://fonts.example.com/a.css\");\nbody { color: red; }\n";
        let (imports, rest) = split_css_imports(css);
        assert_eq!(imports, vec!["https://fonts.example.com/a.css"]);
        assert!(rest.contains("color: red"));
        assert!(!rest.contains("@import"));
    }

    #[test]
    fn test_split_css_imports_bare_form() {
        let css = "@import \"local/theme.css\";\nh1 { font-weight: bold; }";
        let (imports, rest) = split_css_imports(css);
        assert_eq!(imports, vec!["local/theme.css"]);
        assert!(rest.contains("font-weight"));
    }

    #[test]
    fn test_split_css_imports_none() {
        let css = ".series { stroke: none; }";
        let (imports, rest) = split_css_imports(css);
        assert!(imports.is_empty());
        assert!(rest.contains("stroke"));
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("plain"), "\"plain\"");
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
        assert!(js_string("line\nbreak").contains("\\n"));
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/x.js"));
        assert!(is_url("http://example.com/x.js"));
        assert!(!is_url("./local/x.js"));
        assert!(!is_url("x.js"));
    }
}

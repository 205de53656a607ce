//! The per-lease render protocol
//!
//! A deterministic sequence executed against one leased page: viewport and
//! scale, global/theme options, resource injection, the gated custom-code
//! hook, chart construction (or SVG injection), stabilization bounded by the
//! rasterization timeout, export, and cleanup. Nothing survives past the
//! lease: injected resources are disposed through their handles and the page
//! is soft-reset before the bytes are returned.

use crate::utils::clamp_scale;
use crate::{
    ChartConstructor, ExportDefaults, ExportError, ExportRequest, OutputType, PageLease,
    ResourceHandle,
};
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pixels per inch used by the PDF printing path.
const PDF_DPI: f64 = 96.0;

/// Extra wall-clock granted on top of the in-page stabilization deadline.
const STABILIZE_GRACE: Duration = Duration::from_millis(500);

/// Resolved render parameters, computed before any page is acquired
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub out_type: OutputType,
    pub constr: ChartConstructor,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
    pub rasterization_timeout: Duration,
}

impl RenderPlan {
    /// Validate the request and resolve sizes, type, constructor, and
    /// deadline against the configured defaults.
    pub fn from_request(
        request: &ExportRequest,
        defaults: &ExportDefaults,
    ) -> Result<Self, ExportError> {
        match (&request.options, &request.svg) {
            (None, None) => {
                return Err(ExportError::InvalidRenderInput(
                    "neither options nor svg given".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ExportError::InvalidRenderInput(
                    "both options and svg given".to_string(),
                ))
            }
            _ => {}
        }

        let constr = match &request.constr {
            Some(name) => ChartConstructor::parse(name).ok_or_else(|| {
                ExportError::InvalidRenderInput(format!("unknown constructor {name:?}"))
            })?,
            None => defaults.constr,
        };

        let out_type = crate::utils::normalize_output_type(
            request.out_type.as_deref(),
            request.outfile.as_deref(),
            defaults.out_type,
        );

        let (width, height) = resolve_dimensions(request, defaults);
        let scale = if out_type.is_raster() {
            clamp_scale(request.scale.unwrap_or(defaults.default_scale))
        } else {
            // Scale never resizes the SVG-producing chart for vector targets.
            1.0
        };

        Ok(Self {
            out_type,
            constr,
            width,
            height,
            scale,
            rasterization_timeout: request
                .rasterization_timeout
                .unwrap_or(defaults.rasterization_timeout),
        })
    }
}

/// What one protocol run produced
#[derive(Debug)]
pub struct RenderOutcome {
    /// Base64 for raster/pdf targets, UTF-8 for svg
    pub data: String,
    pub mime_type: &'static str,
}

/// Execute the full protocol on a leased page. Cleanup runs in every path;
/// bytes produced alongside a failed cleanup are discarded.
pub async fn render_on_lease(
    lease: &PageLease,
    request: &ExportRequest,
    plan: &RenderPlan,
    slow_mo: Option<u64>,
) -> Result<RenderOutcome, ExportError> {
    let mut handles: Vec<ResourceHandle> = Vec::new();
    let outcome = run_protocol(lease, request, plan, slow_mo, &mut handles).await;
    let cleanup = cleanup_page(lease, &handles).await;

    match (outcome, cleanup) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(e)) => {
            warn!(request = %request.request_id, "Discarding output, cleanup failed: {}", e);
            lease.mark_unhealthy();
            Err(e)
        }
        (Err(e), _) => {
            if e.corrupts_page() {
                lease.mark_unhealthy();
            }
            Err(e)
        }
    }
}

async fn run_protocol(
    lease: &PageLease,
    request: &ExportRequest,
    plan: &RenderPlan,
    slow_mo: Option<u64>,
    handles: &mut Vec<ResourceHandle>,
) -> Result<RenderOutcome, ExportError> {
    let resource = lease.resource();
    let page = &resource.page;

    // 1. Viewport: CSS pixels at chart size, device scale carries the zoom.
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(plan.width.ceil() as i64)
        .height(plan.height.ceil() as i64)
        .device_scale_factor(plan.scale)
        .mobile(false)
        .build()
        .map_err(ExportError::PageError)?;
    page.execute(metrics)
        .await
        .map_err(|e| ExportError::PageError(e.to_string()))?;
    pace(slow_mo).await;

    // 2. Global and theme options, theme merged over global.
    if request.global_options.is_some() || request.theme_options.is_some() {
        let expr = build_set_options_expr(
            request.global_options.as_ref(),
            request.theme_options.as_ref(),
        )?;
        page.evaluate(expr.as_str())
            .await
            .map_err(|e| ExportError::ExportFailed(format!("setOptions: {e}")))?;
    }
    pace(slow_mo).await;

    // 3. Per-request resources; failures are logged and skipped.
    if let Some(resources) = &request.resources {
        if !resources.is_empty() {
            let injected = resource
                .inject_resources(resources, request.allow_file_resources)
                .await;
            handles.extend(injected);
        }
    }
    pace(slow_mo).await;

    // 4. Custom code hook, strictly opt-in.
    run_custom_code(lease, request).await?;
    pace(slow_mo).await;

    // 5/6. Chart content: raw SVG injection, or construction from options.
    let (effective_width, effective_height) = if let Some(svg) = &request.svg {
        let size = inject_svg(page, svg).await?;
        (
            if request.width.is_some() { plan.width } else { size.width.max(1.0) },
            if request.height.is_some() { plan.height } else { size.height.max(1.0) },
        )
    } else {
        construct_chart(page, request, plan).await?;
        (plan.width, plan.height)
    };

    // 7. Stabilize bounded by the rasterization deadline.
    wait_for_stable_svg(page, plan.rasterization_timeout).await?;
    pace(slow_mo).await;

    // 8. Export.
    let data = match plan.out_type {
        OutputType::Svg => serialize_svg(page).await?,
        OutputType::Png => {
            let png = capture_raster_bytes(page).await?;
            base64::engine::general_purpose::STANDARD.encode(png)
        }
        OutputType::Jpeg => {
            let png = capture_raster_bytes(page).await?;
            encode_jpeg(&png)?
        }
        OutputType::Pdf => export_pdf(page, effective_width, effective_height).await?,
    };

    Ok(RenderOutcome {
        data,
        mime_type: plan.out_type.mime_type(),
    })
}

async fn cleanup_page(lease: &PageLease, handles: &[ResourceHandle]) -> Result<(), ExportError> {
    let resource = lease.resource();
    if !handles.is_empty() {
        resource.dispose_resources(handles).await;
    }
    resource.soft_reset().await
}

fn resolve_dimensions(request: &ExportRequest, defaults: &ExportDefaults) -> (f64, f64) {
    let options = request.options.as_ref();

    let width = request
        .width
        .or_else(|| option_f64(options, &["exporting", "sourceWidth"]))
        .or_else(|| option_f64(options, &["chart", "width"]))
        .unwrap_or(defaults.default_width);

    let height = request
        .height
        .or_else(|| option_f64(options, &["exporting", "sourceHeight"]))
        .or_else(|| option_f64(options, &["chart", "height"]))
        .unwrap_or(defaults.default_height);

    (width.max(1.0), height.max(1.0))
}

fn option_f64(options: Option<&serde_json::Value>, path: &[&str]) -> Option<f64> {
    let mut node = options?;
    for key in path {
        node = node.get(key)?;
    }
    node.as_f64().filter(|v| *v > 0.0)
}

fn build_set_options_expr(
    global: Option<&serde_json::Value>,
    theme: Option<&serde_json::Value>,
) -> Result<String, ExportError> {
    let global_json = match global {
        Some(v) => serde_json::to_string(v)?,
        None => "null".to_string(),
    };
    let theme_json = match theme {
        Some(v) => serde_json::to_string(v)?,
        None => "null".to_string(),
    };
    Ok(format!(
        r#"(function (global, theme) {{
  if (typeof Highcharts === 'undefined') {{ throw new Error('library missing'); }}
  if (global) {{ Highcharts.setOptions(global); }}
  if (theme) {{ Highcharts.setOptions(theme); }}
}})({global_json}, {theme_json})"#
    ))
}

/// How a custom-code payload is interpreted
#[derive(Debug, PartialEq)]
enum CustomCodeForm {
    /// A `.js` file path, honored only with file resources allowed
    File(String),
    /// A function literal, invoked as written
    FunctionLiteral(String),
    /// An inline body, wrapped and invoked
    Inline(String),
}

fn classify_custom_code(code: &str) -> CustomCodeForm {
    let trimmed = code.trim();
    if trimmed.ends_with(".js") && !trimmed.contains('\n') && !trimmed.contains('{') {
        return CustomCodeForm::File(trimmed.to_string());
    }
    if trimmed.starts_with("function") {
        return CustomCodeForm::FunctionLiteral(trimmed.to_string());
    }
    if trimmed.starts_with('(') && trimmed.contains("=>") {
        return CustomCodeForm::FunctionLiteral(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("async") {
        if rest.trim_start().starts_with("function") || rest.trim_start().starts_with('(') {
            return CustomCodeForm::FunctionLiteral(trimmed.to_string());
        }
    }
    CustomCodeForm::Inline(trimmed.to_string())
}

async fn run_custom_code(lease: &PageLease, request: &ExportRequest) -> Result<(), ExportError> {
    let Some(code) = &request.custom_code else {
        return Ok(());
    };

    if !request.allow_code_execution {
        // Audit trail: the request asked for code we refused to run.
        info!(
            request = %request.request_id,
            "Custom code present but code execution is disabled, skipping"
        );
        return Ok(());
    }

    let source = match classify_custom_code(code) {
        CustomCodeForm::File(path) => {
            if !request.allow_file_resources {
                info!(
                    request = %request.request_id,
                    path = %path,
                    "Custom code file skipped, file resources are disabled"
                );
                return Ok(());
            }
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                ExportError::ExportFailed(format!("custom code file {path}: {e}"))
            })?;
            content
        }
        CustomCodeForm::FunctionLiteral(literal) => format!("({literal})()"),
        CustomCodeForm::Inline(body) => format!("(function () {{ {body} }})()"),
    };

    lease
        .resource()
        .page
        .evaluate(source.as_str())
        .await
        .map_err(|e| ExportError::ExportFailed(format!("custom code: {e}")))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SvgSize {
    width: f64,
    height: f64,
}

async fn inject_svg(
    page: &chromiumoxide::page::Page,
    svg: &str,
) -> Result<SvgSize, ExportError> {
    let expr = format!(
        r#"(function (svg) {{
  var container = document.getElementById('container');
  container.innerHTML = svg;
  var el = container.querySelector('svg');
  if (!el) {{ throw new Error('payload contains no svg element'); }}
  var rect = el.getBoundingClientRect();
  return {{
    width: (el.width && el.width.baseVal && el.width.baseVal.value) || rect.width,
    height: (el.height && el.height.baseVal && el.height.baseVal.value) || rect.height
  }};
}})({})"#,
        js_string(svg)
    );

    let params = EvaluateParams::builder()
        .expression(expr)
        .return_by_value(true)
        .build()
        .map_err(ExportError::PageError)?;

    page.evaluate(params)
        .await
        .map_err(|e| ExportError::InvalidRenderInput(format!("svg injection: {e}")))?
        .into_value::<SvgSize>()
        .map_err(|e| ExportError::InvalidRenderInput(format!("svg size: {e}")))
}

async fn construct_chart(
    page: &chromiumoxide::page::Page,
    request: &ExportRequest,
    plan: &RenderPlan,
) -> Result<(), ExportError> {
    let options = request.options.as_ref().ok_or_else(|| {
        ExportError::InvalidRenderInput("options missing on chart path".to_string())
    })?;
    let options_json = serde_json::to_string(options)?;

    let callback = match (&request.callback, request.allow_code_execution) {
        (Some(source), true) => source.trim().to_string(),
        (Some(_), false) => {
            info!(
                request = %request.request_id,
                "Constructor callback skipped, code execution is disabled"
            );
            "undefined".to_string()
        }
        (None, _) => "undefined".to_string(),
    };

    let expr = format!(
        r#"(function (options) {{
  if (typeof Highcharts === 'undefined') {{ throw new Error('library missing'); }}
  options.chart = options.chart || {{}};
  options.exporting = options.exporting || {{}};
  options.exporting.enabled = false;
  if (!options.chart.width) {{ options.chart.width = {width}; }}
  if (!options.chart.height) {{ options.chart.height = {height}; }}
  new Highcharts['{constr}']('container', options, {callback});
}})({options_json})"#,
        width = plan.width,
        height = plan.height,
        constr = plan.constr.js_name(),
        callback = callback,
    );

    page.evaluate(expr.as_str())
        .await
        .map_err(|e| ExportError::ExportFailed(format!("chart construction: {e}")))?;
    Ok(())
}

async fn wait_for_stable_svg(
    page: &chromiumoxide::page::Page,
    deadline: Duration,
) -> Result<(), ExportError> {
    let expr = format!(
        r#"new Promise(function (resolve, reject) {{
  var deadline = Date.now() + {timeout_ms};
  function settled() {{
    if (window.Highcharts && Highcharts.charts) {{
      var found = false;
      for (var i = 0; i < Highcharts.charts.length; i++) {{
        var chart = Highcharts.charts[i];
        if (chart) {{
          found = true;
          if (chart.hasRendered === false) {{ return false; }}
        }}
      }}
      if (found) {{ return true; }}
    }}
    return !!document.querySelector('#container svg');
  }}
  (function tick() {{
    if (settled()) {{
      requestAnimationFrame(function () {{
        requestAnimationFrame(function () {{ resolve(true); }});
      }});
    }} else if (Date.now() > deadline) {{
      reject(new Error('chart did not reach a stable state'));
    }} else {{
      setTimeout(tick, 16);
    }}
  }})();
}})"#,
        timeout_ms = deadline.as_millis()
    );

    let params = EvaluateParams::builder()
        .expression(expr)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(ExportError::PageError)?;

    match timeout(deadline + STABILIZE_GRACE, page.evaluate(params)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            debug!("Stabilization rejected: {}", e);
            Err(ExportError::RasterizationTimeout(deadline))
        }
        Err(_) => Err(ExportError::RasterizationTimeout(deadline)),
    }
}

async fn serialize_svg(page: &chromiumoxide::page::Page) -> Result<String, ExportError> {
    const GET_SVG_JS: &str = r#"(function () {
  var el = document.querySelector('#container svg');
  if (!el) { throw new Error('no svg in container'); }
  return new XMLSerializer().serializeToString(el);
})()"#;

    page.evaluate(GET_SVG_JS)
        .await
        .map_err(|e| ExportError::ExportFailed(format!("svg serialization: {e}")))?
        .into_value::<String>()
        .map_err(|e| ExportError::ExportFailed(format!("svg payload: {e}")))
}

async fn capture_raster_bytes(page: &chromiumoxide::page::Page) -> Result<Vec<u8>, ExportError> {
    let element = page
        .find_element("#container svg")
        .await
        .map_err(|e| ExportError::ExportFailed(format!("chart element: {e}")))?;

    element
        .screenshot(CaptureScreenshotFormat::Png)
        .await
        .map_err(|e| ExportError::ExportFailed(format!("capture: {e}")))
}

/// Convert a captured PNG into base64 JPEG. JPEG has no alpha channel, so
/// the image is flattened to RGB first.
fn encode_jpeg(png: &[u8]) -> Result<String, ExportError> {
    let img = image::load_from_memory(png)
        .map_err(|e| ExportError::ExportFailed(format!("decode capture: {e}")))?;

    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut jpeg = Vec::new();
    rgb.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
        .map_err(|e| ExportError::ExportFailed(format!("jpeg encode: {e}")))?;

    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

async fn export_pdf(
    page: &chromiumoxide::page::Page,
    width: f64,
    height: f64,
) -> Result<String, ExportError> {
    let params = PrintToPdfParams::builder()
        .paper_width(width / PDF_DPI)
        .paper_height(height / PDF_DPI)
        .margin_top(0.0)
        .margin_bottom(0.0)
        .margin_left(0.0)
        .margin_right(0.0)
        .print_background(true)
        .build();

    let bytes = page
        .pdf(params)
        .await
        .map_err(|e| ExportError::ExportFailed(format!("pdf: {e}")))?;

    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

async fn pace(slow_mo: Option<u64>) {
    if let Some(ms) = slow_mo {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> ExportDefaults {
        ExportDefaults::default()
    }

    #[test]
    fn test_plan_requires_exactly_one_input() {
        let empty = ExportRequest::default();
        assert!(matches!(
            RenderPlan::from_request(&empty, &defaults()),
            Err(ExportError::InvalidRenderInput(_))
        ));

        let both = ExportRequest {
            options: Some(json!({})),
            svg: Some("<svg/>".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            RenderPlan::from_request(&both, &defaults()),
            Err(ExportError::InvalidRenderInput(_))
        ));
    }

    #[test]
    fn test_plan_rejects_unknown_constructor() {
        let request = ExportRequest {
            options: Some(json!({})),
            constr: Some("pieChart".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            RenderPlan::from_request(&request, &defaults()),
            Err(ExportError::InvalidRenderInput(_))
        ));
    }

    #[test]
    fn test_plan_clamps_scale() {
        let request = ExportRequest {
            options: Some(json!({})),
            scale: Some(99.0),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.scale, 5.0);

        let request = ExportRequest {
            options: Some(json!({})),
            scale: Some(0.01),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.scale, 0.1);
    }

    #[test]
    fn test_plan_scale_ignored_for_vector_targets() {
        let request = ExportRequest {
            options: Some(json!({})),
            scale: Some(3.0),
            out_type: Some("pdf".to_string()),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.scale, 1.0);
    }

    #[test]
    fn test_plan_outfile_extension_wins() {
        let request = ExportRequest {
            options: Some(json!({})),
            out_type: Some("png".to_string()),
            outfile: Some("report.pdf".to_string()),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.out_type, OutputType::Pdf);
        assert_eq!(plan.out_type.mime_type(), "application/pdf");
    }

    #[test]
    fn test_dimension_resolution_precedence() {
        // Explicit request size beats everything.
        let request = ExportRequest {
            options: Some(json!({"chart": {"width": 900, "height": 700}})),
            width: Some(300.0),
            height: Some(200.0),
            ..Default::default()
        };
        assert_eq!(resolve_dimensions(&request, &defaults()), (300.0, 200.0));

        // sourceWidth/sourceHeight beat chart.width/height.
        let request = ExportRequest {
            options: Some(json!({
                "chart": {"width": 900, "height": 700},
                "exporting": {"sourceWidth": 1200, "sourceHeight": 800}
            })),
            ..Default::default()
        };
        assert_eq!(resolve_dimensions(&request, &defaults()), (1200.0, 800.0));

        // chart.width/height beat defaults.
        let request = ExportRequest {
            options: Some(json!({"chart": {"width": 900, "height": 700}})),
            ..Default::default()
        };
        assert_eq!(resolve_dimensions(&request, &defaults()), (900.0, 700.0));

        // Nothing specified falls back to 600x400.
        let request = ExportRequest {
            options: Some(json!({})),
            ..Default::default()
        };
        assert_eq!(resolve_dimensions(&request, &defaults()), (600.0, 400.0));
    }

    #[test]
    fn test_classify_custom_code() {
        assert_eq!(
            classify_custom_code("hooks/setup.js"),
            CustomCodeForm::File("hooks/setup.js".to_string())
        );
        assert!(matches!(
            classify_custom_code("function () { return 1; }"),
            CustomCodeForm::FunctionLiteral(_)
        ));
        assert!(matches!(
            classify_custom_code("() => { Highcharts.setOptions({}); }"),
            CustomCodeForm::FunctionLiteral(_)
        ));
        assert!(matches!(
            classify_custom_code("Highcharts.setOptions({lang: {}});"),
            CustomCodeForm::Inline(_)
        ));
        // A body that merely mentions .js is not a file path.
        assert!(matches!(
            classify_custom_code("var s = 'a.js'; use(s); { }"),
            CustomCodeForm::Inline(_)
        ));
    }

    #[test]
    fn test_set_options_expr_order() {
        let expr = build_set_options_expr(
            Some(&json!({"lang": {"decimalPoint": ","}})),
            Some(&json!({"colors": ["#abcdef"]})),
        )
        .unwrap();
        let global_pos = expr.find("decimalPoint").unwrap();
        let theme_pos = expr.find("abcdef").unwrap();
        assert!(global_pos < theme_pos);
    }

    #[test]
    fn test_plan_default_timeout() {
        let request = ExportRequest {
            options: Some(json!({})),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.rasterization_timeout, Duration::from_millis(1500));

        let request = ExportRequest {
            options: Some(json!({})),
            rasterization_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let plan = RenderPlan::from_request(&request, &defaults()).unwrap();
        assert_eq!(plan.rasterization_timeout, Duration::from_secs(10));
    }
}

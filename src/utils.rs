use crate::OutputType;
use std::net::Ipv4Addr;
use std::time::Duration;
use url::{Host, Url};

/// Lower and upper bounds for the device scale factor.
pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 5.0;

/// Clamp a requested scale into `[0.1, 5.0]`. Non-finite values fall back
/// to 1.0 rather than propagating into the viewport math.
pub fn clamp_scale(scale: f64) -> f64 {
    if !scale.is_finite() {
        return 1.0;
    }
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

/// Resolve the effective output type from the request's `type` and `outfile`.
///
/// Rules: `jpg` parses as `jpeg`; an `outfile` extension that parses wins
/// over an inconsistent `type`; a type named but unsupported falls back to
/// `png`; nothing named at all falls back to the configured default.
pub fn normalize_output_type(
    type_name: Option<&str>,
    outfile: Option<&str>,
    default: OutputType,
) -> OutputType {
    let from_outfile = outfile
        .and_then(|f| f.rsplit('.').next().filter(|ext| *ext != f))
        .and_then(OutputType::parse);

    if let Some(t) = from_outfile {
        return t;
    }

    match type_name {
        Some(name) => OutputType::parse(name).unwrap_or(OutputType::Png),
        None => default,
    }
}

/// Scan a text payload (typically user-supplied SVG) for URLs pointing at
/// private or loopback address space. Returns the first offending URL.
///
/// Requests carrying such references are refused before a page is acquired;
/// the in-page fetch would otherwise happen from inside the service network.
pub fn find_private_address(payload: &str) -> Option<String> {
    let mut rest = payload;

    while let Some(pos) = rest.find("http") {
        let candidate = &rest[pos..];
        if !candidate.starts_with("http://") && !candidate.starts_with("https://") {
            rest = &rest[pos + 4..];
            continue;
        }

        let end = candidate
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | ')' | ']'))
            .unwrap_or(candidate.len());
        let raw = &candidate[..end];

        if let Ok(url) = Url::parse(raw) {
            if host_is_private(url.host()) {
                return Some(raw.to_string());
            }
        }

        rest = &rest[pos + end..];
    }

    None
}

fn host_is_private(host: Option<Host<&str>>) -> bool {
    match host {
        Some(Host::Ipv4(ip)) => ipv4_is_private(ip),
        Some(Host::Ipv6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Some(Host::Domain(name)) => {
            let name = name.to_ascii_lowercase();
            name == "localhost" || name.ends_with(".localhost") || name.ends_with(".local")
        }
        None => false,
    }
}

fn ipv4_is_private(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

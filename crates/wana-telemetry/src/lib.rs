//! OpenTelemetry export for wana.
//!
//! Export activates from the standard OTel environment variables:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 wana serve
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to turn it off even when an endpoint is set.
//! Built without the `telemetry` feature, only [`otel_enabled`] exists and
//! the server logs locally.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Check whether OTel export should be enabled.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Sampling rate for a span name.
///
/// | Prefix        | Rate | |
/// |---------------|------|-|
/// | `ssh.auth.*`  | 100% | every login attempt |
/// | `capture.*`   | 100% | credential writes |
/// | `plugin.*`    | 100% | script execution |
/// | `shell.*`     | 100% | attacker input |
/// | `vfs.*`       |  1%  | tree mutations, high volume |
/// | other         | 10%  | |
pub fn sample_rate(name: &str) -> f64 {
    if name.starts_with("ssh.auth")
        || name.starts_with("capture")
        || name.starts_with("plugin")
        || name.starts_with("shell")
    {
        1.0
    } else if name.starts_with("vfs") {
        0.01
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rate("ssh.auth.password"), 1.0);
        assert_eq!(sample_rate("plugin.command"), 1.0);
        assert_eq!(sample_rate("shell.line"), 1.0);
        assert_eq!(sample_rate("vfs.write"), 0.01);
        assert_eq!(sample_rate("capture.password"), 1.0);
        assert_eq!(sample_rate("ssh.channel"), 0.1);
    }
}

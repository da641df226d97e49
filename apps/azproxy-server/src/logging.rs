use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// configured level.
///
/// # Errors
/// An unparsable filter, or a subscriber that is already installed.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), &cfg.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let installed = match cfg.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!(e).context("failed to install the log subscriber"))
}

fn build_filter(rust_log: Option<&str>, level: &str) -> Result<EnvFilter> {
    match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid RUST_LOG filter '{directives}'")),
        None => {
            let level = level.trim().to_ascii_lowercase();
            EnvFilter::try_new(&level).with_context(|| format!("invalid log level '{level}'"))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn config_level_is_case_insensitive() {
        let filter = build_filter(None, "ERROR").unwrap();
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn rust_log_takes_precedence() {
        let filter = build_filter(Some("llm_proxy=debug"), "info").unwrap();
        assert_eq!(filter.to_string(), "llm_proxy=debug");
    }

    #[test]
    fn blank_rust_log_falls_back_to_config() {
        let filter = build_filter(Some("  "), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn garbage_level_is_rejected() {
        assert!(build_filter(None, "llm_proxy=loudest").is_err());
    }
}

use std::sync::Arc;
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// The webrtc stack reports every ICE, DTLS and SCTP state transition at
/// info, which drowns out session logs.
const QUIET_DEPENDENCIES: &[&str] = &[
    "webrtc=warn",
    "webrtc_ice=warn",
    "webrtc_dtls=warn",
    "webrtc_sctp=warn",
    "webrtc_srtp=warn",
    "webrtc_mdns=error",
];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` replaces the configured filter entirely. The json format is
/// meant for production, pretty for local development.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };

    let writer = match &config.file_path {
        Some(file_path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

/// Filter for the configured level with the webrtc crates capped.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level: LevelFilter = level
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))?;

    let mut filter = EnvFilter::default().add_directive(level.into());
    for directive in QUIET_DEPENDENCIES {
        filter = filter.add_directive(directive.parse::<Directive>()?);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_caps_webrtc_crates() {
        let filter = build_filter("debug").unwrap().to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("webrtc_ice=warn"));
        assert!(filter.contains("webrtc_mdns=error"));
    }

    #[test]
    fn test_filter_level_is_case_insensitive() {
        assert!(build_filter("TRACE").is_ok());
        assert!(build_filter("Warn").is_ok());
    }

    #[test]
    fn test_filter_rejects_invalid_level() {
        assert!(build_filter("loud").is_err());
    }
}

use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Crates whose events follow the configured level; everything else is
/// dropped unless `RUST_LOG` asks for it.
const OWN_TARGETS: [&str; 2] = ["confab", "confab_sfu"];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(&directives)
            .with_context(|| format!("invalid {}: {directives}", EnvFilter::DEFAULT_ENV))?,
        Err(_) => build_filter(&config.level)?,
    };

    let to_file = config.file_path.is_some();
    let writer = match &config.file_path {
        Some(path) => {
            let file =
                open_log_file(path).with_context(|| format!("opening log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed(),
        "pretty" => fmt::layer()
            .pretty()
            .with_ansi(!to_file)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed(),
        other => anyhow::bail!("unknown log format: {other}"),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(())
}

/// Expand a configured level into filter directives
///
/// A bare level applies to this project's crates, with the WebRTC stack
/// held at `warn`. A value that already names targets is used verbatim.
fn filter_directives(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let level = match level.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        other => other.to_string(),
    };
    let mut directives: Vec<String> = OWN_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push("webrtc=warn".to_string());
    directives.join(",")
}

fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(filter_directives(level))
        .with_context(|| format!("invalid log level: {level}"))
}

fn open_log_file(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

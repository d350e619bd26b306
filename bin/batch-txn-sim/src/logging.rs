//! Logging setup for the simulator.

use tracing::*;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{format::FmtSpan, layer},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "batch-txn-sim";

/// Installs stdout logging plus an optional rolling file layer.
///
/// Defaults to `INFO`, overridable via `RUST_LOG`.  Span close events are
/// logged so each batch reports its duration.
pub(crate) fn init(config: &LoggingConfig) {
    let filt = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let stdout_sub = if config.json_format {
        layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filt.clone())
            .boxed()
    } else {
        layer()
            .compact()
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filt.clone())
            .boxed()
    };

    let file_layer = config.log_dir.as_ref().map(|dir| {
        let file_appender = RollingFileAppender::new(Rotation::NEVER, dir, LOG_FILE_PREFIX);

        if config.json_format {
            layer()
                .json()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(filt.clone())
                .boxed()
        } else {
            layer()
                .compact()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(filt.clone())
                .boxed()
        }
    });

    tracing_subscriber::registry()
        .with(stdout_sub)
        .with(file_layer)
        .init();

    if let Some(dir) = &config.log_dir {
        info!(log_dir = %dir.display(), "file logging enabled");
    }
}

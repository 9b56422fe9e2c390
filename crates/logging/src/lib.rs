use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Console + rolling-file logging. The console layer honors `RUST_LOG`
/// (default `info`); the file layer always records debug and up.
pub fn setup_logging() -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .with_filter(console_filter);

    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        "logs",
        "lattice.log",
    );
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug"));

    Registry::default()
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .into_diagnostic()?;

    Ok(())
}

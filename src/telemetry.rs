//! Tracing initialization for the service binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// The filter comes from (in priority order) the `LOG` env var, the config
/// file, then the `-v` verbosity level.
pub fn init(verbosity: u8, logging: &LoggingConfig) {
    let default_directive = match &logging.filter {
        Some(filter) => filter.clone(),
        None => level_from_verbosity(verbosity).to_string(),
    };
    let filter = EnvFilter::builder()
        .with_default_directive(
            default_directive
                .parse()
                .unwrap_or_else(|_| level_from_verbosity(verbosity).into()),
        )
        .with_env_var("LOG")
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if logging.stdout {
        layers.push(build_stderr_layer(logging.stdout_format));
    }
    layers.push(Box::new(filter));

    Registry::default().with(layers).init();
}

fn build_stderr_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::INFO,
        1 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}

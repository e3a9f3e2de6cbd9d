//! Tracing initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. The `LOG` env var overrides the
/// verbosity-derived default filter.
pub fn init(verbosity: u8, logging: &LoggingConfig) {
    let default_directive = logging
        .filter
        .clone()
        .unwrap_or_else(|| level_from_verbosity(verbosity).to_string());
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
        layers.push(build_stdout_layer(logging.stdout_format));
    }
    layers.push(Box::new(filter));

    // A second init (tests, embedders) keeps the first subscriber.
    let _ = Registry::default().with(layers).try_init();
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(
            level_from_verbosity(0),
            tracing::metadata::LevelFilter::ERROR
        );
        assert_eq!(level_from_verbosity(1), tracing::metadata::LevelFilter::INFO);
        assert_eq!(
            level_from_verbosity(5),
            tracing::metadata::LevelFilter::DEBUG
        );
    }
}

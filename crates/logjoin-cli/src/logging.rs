//! Tracing subscriber setup driven by the `logging` config section

use crate::config::LoggingConfig;
use anyhow::Result;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Map a configured level name onto a tracing level, defaulting to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter allowing everything at or above the configured level.
pub fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(parse_level(level)).into())
}

/// Install the global subscriber. Logs go to stderr so joined records on
/// stdout stay machine readable.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&config.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(level_filter("error").max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(level_filter("bogus").max_level_hint(), Some(LevelFilter::INFO));
    }
}

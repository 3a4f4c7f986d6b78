//! Tracing subscriber setup for the binary.

use crate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info,dubflow=debug";

/// Pick the filter directive: `RUST_LOG` wins, then an explicit override
/// (from `-q`/`-v`), then the configured value.
pub fn filter_directive(config: &LoggingConfig, cli_override: Option<&str>) -> String {
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV)
        && !env.is_empty()
    {
        return env;
    }
    match cli_override {
        Some(directive) => directive.to_string(),
        None if config.filter.trim().is_empty() => DEFAULT_FILTER.to_string(),
        None => config.filter.clone(),
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable for `status --json` and friends.
pub fn init_tracing(config: &LoggingConfig, cli_override: Option<&str>) -> anyhow::Result<()> {
    let directive = filter_directive(config, cli_override);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("invalid log filter '{}': {}", directive, e))?;

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?;
    }

    tracing::debug!(filter = %directive, json = config.json, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override_beats_config() {
        if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: "warn".to_string(),
            json: false,
        };
        assert_eq!(filter_directive(&config, Some("debug")), "debug");
        assert_eq!(filter_directive(&config, None), "warn");
    }

    #[test]
    fn test_blank_config_falls_back_to_default() {
        if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: "  ".to_string(),
            json: true,
        };
        assert_eq!(filter_directive(&config, None), DEFAULT_FILTER);
    }
}

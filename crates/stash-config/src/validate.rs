//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Largest accepted `scheduler.coalesce_yields`.
pub const MAX_COALESCE_YIELDS: u32 = 64;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_scheduler(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_scheduler(config: &Config) -> ConfigResult<()> {
    if config.scheduler.coalesce_yields > MAX_COALESCE_YIELDS {
        return Err(ConfigError::Invalid {
            field: "scheduler.coalesce_yields".to_owned(),
            message: format!(
                "coalesce_yields {} is out of range; must be between 0 and {MAX_COALESCE_YIELDS}",
                config.scheduler.coalesce_yields
            ),
        });
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::Invalid {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        });
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::Invalid {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    if let Some(bad) = config
        .logging
        .directives
        .iter()
        .find(|directive| directive.trim().is_empty())
    {
        return Err(ConfigError::Invalid {
            field: "logging.directives".to_owned(),
            message: format!("empty tracing directive {bad:?}"),
        });
    }

    Ok(())
}

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why stash settings could not be resolved.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("cannot read stash config {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: io::Error,
    },

    /// A config file is larger than the loader accepts.
    #[error("stash config {} is {size} bytes, limit is {limit}", path.display())]
    TooLarge {
        /// Offending file.
        path: PathBuf,
        /// Size of the file in bytes.
        size: u64,
        /// Largest accepted size in bytes.
        limit: u64,
    },

    /// TOML that does not describe stash settings.
    ///
    /// `origin` is a file path, or a bracketed label for the embedded
    /// defaults and the merged layers.
    #[error("invalid stash config in {origin}: {source}")]
    Parse {
        /// Where the TOML came from.
        origin: String,
        /// TOML failure.
        #[source]
        source: toml::de::Error,
    },

    /// A setting parsed but is out of range.
    #[error("stash setting `{field}` rejected: {message}")]
    Invalid {
        /// Dotted path of the setting, e.g. `scheduler.coalesce_yields`.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// A `STASH_*` fallback variable could not be coerced to its setting.
    #[error("environment fallback {var} rejected: {message}")]
    Env {
        /// Variable name, e.g. `STASH_COALESCE_YIELDS`.
        var: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Result alias for config loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_setting_source() {
        let err = ConfigError::Env {
            var: "STASH_COALESCE_YIELDS".into(),
            message: "expected an integer".into(),
        };
        assert_eq!(
            err.to_string(),
            "environment fallback STASH_COALESCE_YIELDS rejected: expected an integer"
        );

        let err = ConfigError::TooLarge {
            path: PathBuf::from("/etc/stash/config.toml"),
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "stash config /etc/stash/config.toml is 2048 bytes, limit is 1024"
        );
    }
}

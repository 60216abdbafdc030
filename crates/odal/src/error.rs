//! Result and Error types for the crate.
use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result containing an error variant from this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two configuration roots a file was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    /// The main configuration directory.
    Main,
    /// The overlay directory, whose values take precedence over the main ones.
    Overlay,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKind::Main => write!(f, "main"),
            ConfigKind::Overlay => write!(f, "overlay"),
        }
    }
}

/// Error raised while loading or storing the config named `name`.
#[derive(Debug, Error, Diagnostic)]
#[error("config `{name}` failed")]
pub struct Error {
    /// Type name of the config that failed.
    pub name: &'static str,
    /// What went wrong.
    #[source]
    pub kind: ErrorKind,
}

/// Configuration error variants
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The file could not be read.
    #[error("failed to read {config_kind} config from `{path}`")]
    Load {
        path: String,
        config_kind: ConfigKind,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML, or does not match the config layout.
    #[error("failed to parse {config_kind} config `{path}`")]
    Parse {
        path: String,
        config_kind: ConfigKind,
        #[source]
        source: toml::de::Error,
    },

    /// The merged main and overlay tables do not match the config layout.
    #[error("failed to deserialize merged config")]
    Merge(#[source] toml::de::Error),

    /// The config could not be turned into a TOML table.
    #[error("failed to serialize config")]
    Serialize(#[source] toml::ser::Error),

    /// The serialized config could not be written.
    #[error("failed to write config to `{path}`")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

//! Crate-level error type.
//!
//! Item-level operations (query, modify, script execution, document decoding)
//! return [`Result`].  The entrance, parser and manager layers catch these,
//! log them, and report a plain `bool` to their callers.

use std::path::PathBuf;

use thiserror::Error;

/// Every failure the tuning engine can surface.
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("malformed optimize document: {0}")]
    Parse(String),

    #[error("unknown optimize type '{0}'")]
    UnknownType(String),

    #[error("template '{template}' references missing parameter '{key}'")]
    Template { template: String, key: String },

    #[error("expression error: {0}")]
    Expr(String),

    #[error("cannot coerce '{value}' to {value_type}")]
    Value { value: String, value_type: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("failed to modify '{name}': {reason}")]
    Modify { name: String, reason: String },

    #[error("command '{command}' failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("entrance used before it was bound")]
    Unbound,

    #[error("entrance is already bound")]
    AlreadyBound,

    #[error("optimize environment has not been set")]
    EnvironmentUnset,

    #[error("component '{0}' is not registered")]
    ComponentNotRegistered(String),

    #[error("no optimize parser available for schema version '{0}'")]
    NoParser(String),

    #[error("invalid version '{0}'")]
    Version(String),
}

impl OptimizeError {
    /// Wrap an I/O error together with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OptimizeError::Io { path: path.into(), source }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OptimizeError>;

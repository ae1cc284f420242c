//! Error types for the l2cap-engine library
//!
//! Stack-level failures: loading and validating the controller/stack
//! configuration. Protocol outcomes are never reported through these types,
//! they reach channel owners through their callbacks.

use thiserror::Error;

/// Errors raised while building a stack instance
#[derive(Error, Debug)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for stack setup operations
pub type Result<T> = std::result::Result<T, StackError>;

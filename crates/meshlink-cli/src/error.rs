//! Error handling for the MeshLink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("MeshLink error: {0}")]
    Mesh(#[from] meshlink_core::MeshError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration loading error: {0}")]
    Loading(#[from] figment::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

// ABOUTME: Application-wide error types for machine-ssh.
// ABOUTME: Wraps SSH failures alongside configuration and I/O errors for the CLI.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Ssh(#[from] crate::ssh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

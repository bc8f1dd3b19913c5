//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::ControlPlaneConfig;
use crate::config::seed::SeedFile;
use crate::config::validation::{validate_config, ValidationError};

/// Failure to bring up the process from its bootstrap inputs.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("seed definition '{key}' rejected: {reason}")]
    Seed { key: String, reason: String },

    #[error("failed to start {component}: {reason}")]
    Startup {
        component: &'static str,
        reason: String,
    },
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ControlPlaneConfig, BootstrapError> {
    let content = read(path)?;
    let config: ControlPlaneConfig =
        toml::from_str(&content).map_err(|source| BootstrapError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    validate_config(&config).map_err(BootstrapError::Validation)?;

    Ok(config)
}

/// Load a seed definitions file.
pub fn load_seed(path: &Path) -> Result<SeedFile, BootstrapError> {
    let content = read(path)?;
    toml::from_str(&content).map_err(|source| BootstrapError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<String, BootstrapError> {
    fs::read_to_string(path).map_err(|source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    })
}

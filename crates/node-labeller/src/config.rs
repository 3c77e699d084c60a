//! Labeller Configuration
//!
//! Everything the labeller needs beyond cluster credentials, which come from the ambient
//! kubeconfig or in-cluster service account.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Default label definition directory, relative to the working directory
pub const DEFAULT_LABEL_DIR: &str = "labels";

/// Node Auto Labeller for Kubernetes
#[derive(Debug, Clone, Parser)]
#[command(name = "node-labeller", version, about)]
pub struct Config {
    /// Label directory to monitor
    #[arg(long, env = "LABEL_DIR", default_value = DEFAULT_LABEL_DIR)]
    pub label_dir: PathBuf,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label_dir: PathBuf::from(DEFAULT_LABEL_DIR),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Validate that configuration has the required fields
    pub fn validate(&self) -> Result<()> {
        if self.label_dir.as_os_str().is_empty() {
            return Err(Error::Config("label directory must not be empty".to_string()));
        }

        Ok(())
    }
}

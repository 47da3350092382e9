//! # Run Configuration
//!
//! Every tunable of a pipeline run lives in `PipelineConfig`. The defaults are the
//! thresholds the scoring protocol was published with, so a run without a config
//! file is the reference run. A TOML file may override any subset of fields, and
//! the CLI may override the file.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of SNPs per randomized chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
/// Number of chunk queries allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration file '{path}' is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// A variant whose missing-call rate is at or above this value is dropped.
    pub max_missing_rate: f64,
    /// With `maf_filter` on, an effect-allele frequency at or below this value drops the variant.
    pub min_effect_allele_frequency: f64,
    pub maf_filter: bool,
    /// A Hardy-Weinberg p-value at or below this value drops the variant.
    pub hwe_p_threshold: f64,
    pub chunk_size: usize,
    pub concurrency: usize,
    /// Program used for indexed genotype queries.
    pub bcftools: PathBuf,
    /// Optional external HWE routine: program followed by its arguments. When unset the
    /// in-process exact test is used.
    pub hwe_command: Option<Vec<String>>,
    /// Seed for chunk shuffling. Unseeded runs draw from the thread RNG.
    pub shuffle_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_missing_rate: 0.10,
            min_effect_allele_frequency: 0.01,
            maf_filter: true,
            hwe_p_threshold: 1e-6,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            bcftools: PathBuf::from("bcftools"),
            hwe_command: None,
            shuffle_seed: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Rejects values that would silently make every variant pass or fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit_interval = |field: &'static str, value: f64| {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is not within [0, 1]"),
                })
            }
        };
        unit_interval("max_missing_rate", self.max_missing_rate)?;
        unit_interval("min_effect_allele_frequency", self.min_effect_allele_frequency)?;
        unit_interval("hwe_p_threshold", self.hwe_p_threshold)?;

        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(command) = &self.hwe_command {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "hwe_command",
                    reason: "must name a program".to_string(),
                });
            }
        }
        Ok(())
    }
}

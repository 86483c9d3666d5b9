// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space tunables loaded from TOML
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Config, ConfigError
//! DEPENDS_ON: serde, toml, std::fs
//! TESTS: defaults; inline TOML; file loading via tempfile; validation failures

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{DEFAULT_SLOTS, MAX_SLOT_LIMIT};

/// Smallest frame pool that can hold a root table and one mapped page.
const MIN_FRAMES: usize = 8;

/// Tunables for one address space.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of domain slots.
    pub max_domains: usize,
    /// Number of context slots, including the master context.
    pub max_contexts: usize,
    /// Size of the physical frame pool shared by data and page-table pages.
    pub physical_frames: usize,
    /// New contexts join the global domain with every capability.
    pub allow_global: bool,
    /// Instruction fetches additionally require EXECUTE.
    pub enforce_execute: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_domains: DEFAULT_SLOTS,
            max_contexts: DEFAULT_SLOTS,
            physical_frames: 65536,
            allow_global: false,
            enforce_execute: false,
        }
    }
}

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML for [`Config`].
    #[error("failed to parse config: {source}")]
    Parse {
        /// Underlying decoder error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is outside its accepted range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl Config {
    /// Parses and validates a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(data).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    /// Checks slot counts and the frame pool size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_domains == 0 || self.max_domains > MAX_SLOT_LIMIT {
            return Err(ConfigError::Invalid("max_domains must be within 1..=65536"));
        }
        if self.max_contexts == 0 || self.max_contexts > MAX_SLOT_LIMIT {
            return Err(ConfigError::Invalid("max_contexts must be within 1..=65536"));
        }
        if self.physical_frames < MIN_FRAMES {
            return Err(ConfigError::Invalid("physical_frames must be at least 8"));
        }
        Ok(())
    }
}

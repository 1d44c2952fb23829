//! Configuration loading and defaults.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::storage::MIN_PAGE_SIZE;
use crate::tree::{ChooseMethod, SlimOptions, SplitMethod};

/// Runtime configuration for the slimdb harness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Page size in bytes. Default 8192 (8 KB).
    pub page_size: usize,

    /// Subtree selection policy for inserts. Default "min_dist".
    pub choose_method: ChooseMethod,

    /// Node split policy. Default "spanning_tree".
    pub split_method: SplitMethod,

    /// Whether kNN queries keep objects tied with the k-th distance.
    pub allow_ties: bool,

    /// Per-dimension metric weights; empty means unweighted.
    pub weights: Vec<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 8192,
            choose_method: ChooseMethod::default(),
            split_method: SplitMethod::default(),
            allow_ties: false,
            weights: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Empty file returns the defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let c: Config = toml::from_str(&s)?;
        c.validate()?;
        Ok(c)
    }

    /// Use default config. Convenience for tests and minimal setups.
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Tree construction options carried by this config.
    pub fn options(&self) -> SlimOptions {
        SlimOptions {
            choose_method: self.choose_method,
            split_method: self.split_method,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            anyhow::bail!("page_size must be at least {} bytes", MIN_PAGE_SIZE);
        }
        if self.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("weights must be finite and non-negative");
        }
        Ok(())
    }
}

//! Policy seed files.
//!
//! A seed file pins policies for known identities at start-up, ahead of any
//! traffic. Seeds are applied over whatever the store already holds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::policy::{validate_limits, PolicyPatch};
use crate::error::{GateError, Result};

/// A complete seed document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySeedFile {
    #[serde(default)]
    pub policies: Vec<PolicySeed>,
}

/// A fully specified policy for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySeed {
    /// Identity key: an address as is, or `credential:{value}`
    pub identity: String,
    pub window_seconds: i64,
    pub max_requests: i64,
    pub block_seconds: i64,
}

impl PolicySeed {
    /// The seed as a patch overriding every numeric field.
    pub fn as_patch(&self) -> PolicyPatch {
        PolicyPatch {
            window_seconds: Some(self.window_seconds),
            max_requests: Some(self.max_requests),
            block_seconds: Some(self.block_seconds),
        }
    }
}

impl PolicySeedFile {
    /// Load seeds from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy seeds");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse seeds from YAML, rejecting any entry that would be an invalid policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicySeedFile = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse policy seeds: {}", e)))?;

        for seed in &file.policies {
            if seed.identity.is_empty() {
                return Err(GateError::Config("policy seed with empty identity".into()));
            }
            validate_limits(seed.window_seconds, seed.max_requests, seed.block_seconds).map_err(
                |e| GateError::Config(format!("seed for {}: {}", seed.identity, e)),
            )?;
        }
        Ok(file)
    }
}

//! Run-wide configuration, loaded from TOML.
//!
//! A three-tier loading API (`load_from_file`/`load_from_str`/`Default`)
//! over [`RunParameters`]. Pure ambient plumbing — it carries logging
//! level, default pipe sizing, and per-node parameter overrides, never a
//! graph layout; assembling a graph from a file is left to callers.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::core::context::Parameters;

/// Top-level run configuration. Every field has a default, so a caller can
/// load a partial TOML document and still get a usable value.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Passed to [`crate::logging::init_logging`] when `RUST_LOG` is unset.
    pub log_level: String,
    /// Default bounded capacity for a node's output pipe when no
    /// per-edge override is set via `GraphBuilder::with_pipe_capacity`.
    pub default_pipe_capacity: usize,
    /// Per-node parameter overrides, keyed by node id. Merged into the
    /// run's base parameters by [`RunParameters::parameters_for`].
    pub node_parameters: HashMap<String, HashMap<String, Value>>,
    /// Parameters applied to every node before any per-node override.
    pub defaults: HashMap<String, Value>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_pipe_capacity: 128,
            node_parameters: HashMap::new(),
            defaults: HashMap::new(),
        }
    }
}

impl RunParameters {
    /// The run-wide [`Parameters`] bag, before any per-node layering.
    pub fn base_parameters(&self) -> Parameters {
        let mut parameters = Parameters::new();
        for (key, value) in &self.defaults {
            parameters.set(key.clone(), value.clone());
        }
        parameters
    }

    /// The override bag for one node, if any was configured.
    pub fn parameters_for(&self, node_id: &str) -> Option<Parameters> {
        let overrides = self.node_parameters.get(node_id)?;
        let mut parameters = Parameters::new();
        for (key, value) in overrides {
            parameters.set(key.clone(), value.clone());
        }
        Some(parameters)
    }
}

/// Reads and parses a [`RunParameters`] document from `path`.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<RunParameters, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    load_from_str(&content)
}

/// Parses a [`RunParameters`] document already held in memory.
pub fn load_from_str(content: &str) -> Result<RunParameters, Box<dyn std::error::Error>> {
    let parameters = toml::from_str(content)?;
    Ok(parameters)
}

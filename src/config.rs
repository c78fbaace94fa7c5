//! Sidecar configuration model
//!
//! The configuration file is a YAML document describing what gets injected
//! into every admitted Pod:
//!
//! ```yaml
//! containers:
//!   - name: sidecar
//!     image: nginx:1.19
//! volumes:
//!   - name: shared
//!     emptyDir: {}
//! annotations:
//!   sidecar.example.com/injected: "true"
//! ```
//!
//! Containers and volumes use the core/v1 schemas verbatim, so anything valid
//! in a Pod spec is valid here. The config is loaded once at startup and never
//! mutated afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use k8s_openapi::api::core::v1::{Container, Volume};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Containers, volumes and annotations injected into every admitted Pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SidecarConfig {
    /// Containers appended to `spec.containers`, in order
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Volumes appended to `spec.volumes`, in order
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Annotations merged into `metadata.annotations`
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl SidecarConfig {
    /// Read and validate the sidecar configuration at `path`
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config_load(format!("failed to read {}: {}", path.display(), e)))?;

        Self::from_yaml(&content)
            .map_err(|e| Error::config_load(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate a sidecar configuration from YAML
    pub fn from_yaml(input: &str) -> Result<Self, Error> {
        let config: SidecarConfig = serde_yaml::from_str(input)
            .map_err(|e| Error::config_load(format!("malformed YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that container and volume names are non-empty and unique
    ///
    /// Duplicate names would make every mutated Pod fail API server validation.
    pub fn validate(&self) -> Result<(), Error> {
        unique_names("container", self.containers.iter().map(|c| c.name.as_str()))?;
        unique_names("volume", self.volumes.iter().map(|v| v.name.as_str()))?;

        if let Some(key) = self.annotations.keys().find(|k| k.is_empty()) {
            return Err(Error::config_load(format!(
                "annotation key must not be empty (value {:?})",
                self.annotations[key]
            )));
        }

        Ok(())
    }

    /// True when the config injects nothing at all
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.volumes.is_empty() && self.annotations.is_empty()
    }

    /// Names of the configured containers, for logging
    pub fn container_names(&self) -> Vec<&str> {
        self.containers.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of the configured volumes, for logging
    pub fn volume_names(&self) -> Vec<&str> {
        self.volumes.iter().map(|v| v.name.as_str()).collect()
    }
}

fn unique_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for (index, name) in names.enumerate() {
        if name.is_empty() {
            return Err(Error::config_load(format!("{kind} at index {index} has no name")));
        }
        if !seen.insert(name) {
            return Err(Error::config_load(format!("duplicate {kind} name '{name}'")));
        }
    }
    Ok(())
}

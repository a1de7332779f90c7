use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the optional configuration file inside a data directory.
pub const CONFIG_FILE: &str = "shelf.yaml";

/// Store-wide settings, read from `shelf.yaml` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Extension shared by record files and index entries.
    pub extension: String,
    /// Length of generated primary identifiers.
    pub id_length: usize,
    /// Default length of `random` fields.
    pub random_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            extension: "json".to_string(),
            id_length: 24,
            random_length: 8,
        }
    }
}

impl StoreConfig {
    /// Load `shelf.yaml` from a data directory, falling back to defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(StoreConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        parse_config_str(&content)
    }
}

/// Parse configuration YAML. Missing keys take their defaults.
pub fn parse_config_str(content: &str) -> Result<StoreConfig> {
    if content.trim().is_empty() {
        return Ok(StoreConfig::default());
    }
    let config: StoreConfig = serde_yaml::from_str(content)?;
    Ok(config)
}

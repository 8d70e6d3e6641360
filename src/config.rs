//! Buffer cache configuration

use crate::cache::PolicyMerge;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunables for a [`BufferCache`](crate::BufferCache)
///
/// Missing keys take their default values when loading from TOML:
///
/// ```toml
/// enabled = true
/// fill_byte = 0
/// policy_merge = "fresh"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether fetched data is retained in version maps
    pub enabled: bool,
    /// Byte rendered for positions no buffer supplies
    pub fill_byte: u8,
    /// Metadata handling when new data displaces cached chunks
    pub policy_merge: PolicyMerge,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            fill_byte: 0,
            policy_merge: PolicyMerge::Fresh,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(text)?;
        debug!("Loaded cache config: {:?}", config);
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| CacheError::Config(e.to_string()))
    }
}

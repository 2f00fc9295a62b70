use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Configuration for an [`EntityStore`](crate::EntityStore).
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the OS thread that runs the store worker.
    pub worker_thread_name: String,
    /// Capacity of the property-change broadcast channel.
    pub property_channel_capacity: usize,
    /// Group consecutive pending operations of the same kind and entity type
    /// into one storage operation.
    pub group_storage_operations: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: "eddy-store".to_string(),
            property_channel_capacity: 64,
            group_storage_operations: true,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: StoreConfig = toml::from_str(text)
            .map_err(|e| StoreError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StoreError::Config(format!("failed to serialize config: {e}")))
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.property_channel_capacity == 0 {
            return Err(StoreError::Config(
                "property_channel_capacity must be greater than zero".into(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(StoreError::Config(
                "worker_thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.worker_thread_name, "eddy-store");
        assert_eq!(config.property_channel_capacity, 64);
        assert!(config.group_storage_operations);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = StoreConfig::from_toml_str("group_storage_operations = false").unwrap();
        assert!(!config.group_storage_operations);
        assert_eq!(config.property_channel_capacity, 64);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = StoreConfig::from_toml_str("property_channel_capacity = 0").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            StoreConfig::from_toml_str("worker_thread_name = ").unwrap_err(),
            StoreError::Config(_)
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_thread_name = \"blog-store\"").unwrap();
        let config = StoreConfig::load(file.path()).unwrap();
        assert_eq!(config.worker_thread_name, "blog-store");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn toml_output_parses_back() {
        let config = StoreConfig {
            worker_thread_name: "w".into(),
            property_channel_capacity: 8,
            group_storage_operations: false,
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(StoreConfig::from_toml_str(&text).unwrap(), config);
    }
}

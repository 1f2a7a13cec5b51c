//! Defines the configuration of a native store: where it lives, which
//! indexes it keeps and how it locks and syncs.

use crate::error::{Result, StoreError};
use crate::index::IndexSpec;
use crate::options::SyncMode;
use derive_builder::{Builder, UninitializedFieldError};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TRIPLE_INDEXES: &str = "spoc";
pub const DEFAULT_VALUE_CACHE_SIZE: usize = 512;
pub const DEFAULT_VALUE_ID_CACHE_SIZE: usize = 128;

fn default_triple_indexes() -> String {
    DEFAULT_TRIPLE_INDEXES.to_string()
}

fn default_value_cache_size() -> usize {
    DEFAULT_VALUE_CACHE_SIZE
}

fn default_value_id_cache_size() -> usize {
    DEFAULT_VALUE_ID_CACHE_SIZE
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Builder)]
#[builder(
    pattern = "owned",
    build_fn(validate = "Self::validate", error = "StoreError")
)]
pub struct StoreConfig {
    /// Directory holding every file of the store.
    #[builder(setter(into))]
    pub data_dir: PathBuf,
    /// Comma or whitespace separated index permutations, e.g. `spoc,posc`.
    #[builder(setter(into), default = "default_triple_indexes()")]
    #[serde(default = "default_triple_indexes")]
    pub triple_indexes: String,
    /// Record every held lock with a backtrace (diagnostics).
    #[builder(default)]
    #[serde(default)]
    pub track_locks: bool,
    /// fsync data files on every commit.
    #[builder(default)]
    #[serde(default)]
    pub force_sync: bool,
    // unbounded when absent
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    #[builder(default = "DEFAULT_VALUE_CACHE_SIZE")]
    #[serde(default = "default_value_cache_size")]
    pub value_cache_size: usize,
    #[builder(default = "DEFAULT_VALUE_ID_CACHE_SIZE")]
    #[serde(default = "default_value_id_cache_size")]
    pub value_id_cache_size: usize,
}

impl From<UninitializedFieldError> for StoreError {
    fn from(e: UninitializedFieldError) -> Self {
        StoreError::Configuration(format!("missing configuration field '{}'", e.field_name()))
    }
}

impl StoreConfigBuilder {
    fn validate(&self) -> std::result::Result<(), StoreError> {
        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(StoreError::Configuration("data directory must not be empty".into()));
            }
        }
        if let Some(indexes) = &self.triple_indexes {
            IndexSpec::parse_list(indexes)?;
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Configuration with every default for the store in `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            triple_indexes: default_triple_indexes(),
            track_locks: false,
            force_sync: false,
            lock_timeout_ms: None,
            value_cache_size: DEFAULT_VALUE_CACHE_SIZE,
            value_id_cache_size: DEFAULT_VALUE_ID_CACHE_SIZE,
        }
    }

    pub fn index_specs(&self) -> Result<Vec<IndexSpec>> {
        IndexSpec::parse_list(&self.triple_indexes)
    }

    pub fn sync_mode(&self) -> SyncMode {
        SyncMode::from(self.force_sync)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn save_to_file(&self, file: &Path) -> Result<()> {
        let config_str = serde_json::to_string_pretty(&self)?;
        let mut file = std::fs::File::create(file)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    pub fn from_file(file: &Path) -> Result<Self> {
        let file = std::fs::File::open(file)?;
        let reader = BufReader::new(file);
        let config: StoreConfig = serde_json::from_reader(reader)
            .map_err(|e| StoreError::Configuration(format!("invalid configuration file: {e}")))?;
        config.index_specs()?;
        Ok(config)
    }

    /// Prints out the current configuration for command line output.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  Data directory: {}", self.data_dir.display());
        println!("  Triple indexes: {}", self.triple_indexes);
        println!("  Track locks: {}", self.track_locks);
        println!("  Force sync: {}", self.force_sync);
        match self.lock_timeout_ms {
            Some(ms) => println!("  Lock timeout: {ms} ms"),
            None => println!("  Lock timeout: none"),
        }
        println!("  Value cache size: {}", self.value_cache_size);
        println!("  Value id cache size: {}", self.value_id_cache_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builder_fills_defaults() {
        let config = StoreConfig::builder().data_dir("/tmp/store").build().unwrap();
        assert_eq!(config, StoreConfig::new("/tmp/store"));
        assert_eq!(config.lock_timeout(), None);
        assert_eq!(config.sync_mode(), SyncMode::Flush);
    }

    #[test]
    fn builder_rejects_bad_input() {
        assert!(matches!(
            StoreConfig::builder().build(),
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            StoreConfig::builder()
                .data_dir("/tmp/store")
                .triple_indexes("spoc,xyzw")
                .build(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn file_round_trip_keeps_every_field() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::builder()
            .data_dir(dir.path())
            .triple_indexes("spoc, posc")
            .track_locks(true)
            .force_sync(true)
            .lock_timeout_ms(250)
            .value_cache_size(8)
            .build()
            .unwrap();
        let path = dir.path().join("config.json");
        config.save_to_file(&path).unwrap();
        let loaded = StoreConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.lock_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(loaded.index_specs().unwrap().len(), 2);
    }

    #[test]
    fn missing_fields_take_defaults_when_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/var/lib/store"}"#).unwrap();
        let loaded = StoreConfig::from_file(&path).unwrap();
        assert_eq!(loaded, StoreConfig::new("/var/lib/store"));
    }
}

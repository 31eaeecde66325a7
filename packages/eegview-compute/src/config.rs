use crate::device::{HostDeviceOptions, Precision};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Engine settings, stored as JSON.
///
/// Every field has a default so partial files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub platform: usize,
    #[serde(default)]
    pub device: usize,
    #[serde(default)]
    pub precision: Precision,
    /// Samples per channel in one cache block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Global memory of the emulated host device, in MiB.
    #[serde(default = "default_host_device_memory_mb")]
    pub host_device_memory_mb: u64,
    /// Upper bound on memory handed to the block cache, in MiB.
    #[serde(default)]
    pub gpu_memory_limit_mb: Option<u64>,
    /// Tier-2 capacity before growing to the channel count.
    #[serde(default = "default_kernel_cache_size")]
    pub kernel_cache_size: usize,
    #[serde(default = "default_kernel_cache_persistent_size")]
    pub kernel_cache_persistent_size: usize,
    #[serde(default = "default_true")]
    pub kernel_cache_persistent: bool,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Threads of the montage compile pool; hardware concurrency if unset.
    #[serde(default)]
    pub compile_threads: Option<usize>,
}

fn default_block_size() -> usize {
    32 * 1024
}

fn default_host_device_memory_mb() -> u64 {
    1024
}

fn default_kernel_cache_size() -> usize {
    100
}

fn default_kernel_cache_persistent_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform: 0,
            device: 0,
            precision: Precision::default(),
            block_size: default_block_size(),
            host_device_memory_mb: default_host_device_memory_mb(),
            gpu_memory_limit_mb: None,
            kernel_cache_size: default_kernel_cache_size(),
            kernel_cache_persistent_size: default_kernel_cache_persistent_size(),
            kernel_cache_persistent: true,
            cache_dir: None,
            compile_threads: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        log::debug!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                log::debug!("No engine config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Directory holding the persistent kernel cache.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("eegview")
        })
    }

    pub fn host_device_options(&self) -> HostDeviceOptions {
        HostDeviceOptions {
            global_memory: self.host_device_memory_mb * MIB,
            ..HostDeviceOptions::default()
        }
    }

    pub fn gpu_memory_limit(&self) -> Option<u64> {
        self.gpu_memory_limit_mb.map(|mb| mb * MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"precision": "double", "kernel_cache_size": 8}"#).unwrap();
        assert_eq!(config.precision, Precision::Double);
        assert_eq!(config.kernel_cache_size, 8);
        assert_eq!(config.block_size, 32 * 1024);
        assert!(config.kernel_cache_persistent);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("engine.json");
        let config = EngineConfig {
            block_size: 512,
            cache_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::load_or_default(Some(&path)).unwrap(), config);
        assert_eq!(config.resolved_cache_dir(), dir.path());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load_or_default(Some(&dir.path().join("none.json"))).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(EngineConfig::load(&dir.path().join("none.json")).is_err());
    }
}

pub mod devices;
pub mod kernel_cache;
pub mod pipeline;
pub mod validate;

use crate::exit_codes;
use eegview_compute::{ComputeError, EngineConfig, MontageKind};
use std::path::{Path, PathBuf};

/// Engine settings shared by every subcommand.
pub struct EngineOptions {
    pub config: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

impl EngineOptions {
    /// Load the config file (defaults if absent) and apply overrides.
    pub fn load(&self) -> Result<EngineConfig, i32> {
        let mut config = EngineConfig::load_or_default(self.config.as_deref()).map_err(|e| {
            eprintln!("Error: Failed to load config: {}", e);
            exit_codes::INPUT_ERROR
        })?;
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

/// Exit code for a library error.
pub fn exit_code_for(err: &ComputeError) -> i32 {
    match err {
        ComputeError::Compile { .. }
        | ComputeError::InvalidParameter(_)
        | ComputeError::Size { .. } => exit_codes::INPUT_ERROR,
        ComputeError::Device { .. }
        | ComputeError::Transform { .. }
        | ComputeError::ResourceExhausted { .. } => exit_codes::DEVICE_ERROR,
        ComputeError::IoError(_) | ComputeError::Serialization(_) => exit_codes::EXECUTION_ERROR,
    }
}

/// Print `err` and return its exit code.
pub fn fail(err: ComputeError) -> i32 {
    eprintln!("Error: {}", err);
    exit_code_for(&err)
}

pub fn kind_name(kind: MontageKind) -> String {
    match kind {
        MontageKind::Identity => "identity".to_string(),
        MontageKind::Copy(channel) => format!("copy({})", channel),
        MontageKind::Compiled => "compiled".to_string(),
    }
}

/// Contents of an optional kernel header file.
pub fn read_header(path: Option<&Path>) -> Result<String, i32> {
    match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            eprintln!("Error: Failed to read header '{}': {}", path.display(), e);
            exit_codes::INPUT_ERROR
        }),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eegview_compute::DeviceStatus;

    #[test]
    fn test_exit_codes_by_error_kind() {
        let compile = ComputeError::Compile {
            log: "montage.cl:1:1: error".to_string(),
        };
        assert_eq!(exit_code_for(&compile), exit_codes::INPUT_ERROR);

        let device = ComputeError::Device {
            status: DeviceStatus::InvalidDevice,
            operation: "select device".to_string(),
        };
        assert_eq!(exit_code_for(&device), exit_codes::DEVICE_ERROR);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(kind_name(MontageKind::Identity), "identity");
        assert_eq!(kind_name(MontageKind::Copy(-1)), "copy(-1)");
    }

    #[test]
    fn test_cache_dir_override() {
        let options = EngineOptions {
            config: None,
            cache_dir: Some(PathBuf::from("/tmp/eegview-test")),
        };
        let config = options.load().unwrap();
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/eegview-test"));
    }
}

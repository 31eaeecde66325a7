use std::fmt;
use thiserror::Error;

/// Status codes reported by the compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    InvalidPlatform,
    InvalidDevice,
    InvalidBufferSize,
    MemObjectAllocationFailure,
    InvalidBinary,
    InvalidKernelArgs,
    ExecutionFailure,
    OutOfResources,
}

impl DeviceStatus {
    /// Numeric code in the OpenCL status convention.
    pub fn code(self) -> i32 {
        match self {
            DeviceStatus::InvalidPlatform => -32,
            DeviceStatus::InvalidDevice => -33,
            DeviceStatus::InvalidBufferSize => -61,
            DeviceStatus::MemObjectAllocationFailure => -4,
            DeviceStatus::InvalidBinary => -42,
            DeviceStatus::InvalidKernelArgs => -52,
            DeviceStatus::ExecutionFailure => -14,
            DeviceStatus::OutOfResources => -5,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Status codes reported by the FFT plan layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStatus {
    InvalidLength,
    InvalidBatch,
    BufferTooSmall,
}

impl fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Device error {status} during {operation}")]
    Device {
        status: DeviceStatus,
        operation: String,
    },

    #[error("FFT error {status} during {operation}")]
    Transform {
        status: TransformStatus,
        operation: String,
    },

    #[error("Buffer too small for {what}: {required} bytes required, {actual} available")]
    Size {
        what: String,
        required: usize,
        actual: usize,
    },

    #[error("Montage compilation failed:\n{log}")]
    Compile { log: String },

    #[error("Cache capacity is zero: {bytes_per_block} bytes per block, {available} bytes available")]
    ResourceExhausted { bytes_per_block: usize, available: u64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ComputeError {
    pub(crate) fn device(status: DeviceStatus, operation: impl Into<String>) -> Self {
        ComputeError::Device {
            status,
            operation: operation.into(),
        }
    }

    pub(crate) fn transform(status: TransformStatus, operation: impl Into<String>) -> Self {
        ComputeError::Transform {
            status,
            operation: operation.into(),
        }
    }

    /// Check that a caller supplied buffer holds at least `required` bytes.
    pub(crate) fn check_size(what: &str, required: usize, actual: usize) -> Result<()> {
        if actual < required {
            return Err(ComputeError::Size {
                what: what.to_string(),
                required,
                actual,
            });
        }
        Ok(())
    }
}

impl From<serde_json::Error> for ComputeError {
    fn from(err: serde_json::Error) -> Self {
        ComputeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;

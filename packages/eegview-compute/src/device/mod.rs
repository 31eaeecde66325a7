//! Host-emulated compute device.
//!
//! The engine talks to its compute device through a small OpenCL-shaped
//! surface: platforms and devices selected by index, device buffers charged
//! against a global memory budget, in-order command queues, events, program
//! objects compiled from source or loaded from binaries, and batched real
//! FFT plans. This module provides that surface on the host: every queue owns
//! a worker thread that executes commands in submission order.

mod buffer;
mod compiler;
mod fft;
mod program;
mod queue;
mod vm;

pub use buffer::DeviceBuffer;
pub use fft::FftPlan;
pub use program::{Kernel, KernelCode, MontageArgs, Program};
pub use queue::{CommandQueue, Event, EventStatus};

use crate::error::{ComputeError, DeviceStatus, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Numeric precision of buffers, kernels and transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float,
    Double,
}

impl Precision {
    pub fn element_size(self) -> usize {
        match self {
            Precision::Float => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }

    /// Type name used in kernel source.
    pub fn type_name(self) -> &'static str {
        match self {
            Precision::Float => "float",
            Precision::Double => "double",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "float" => Some(Precision::Float),
            "double" => Some(Precision::Double),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Element type stored in device buffers.
pub trait Sample: rustfft::FftNum + Default + PartialOrd {
    const PRECISION: Precision;

    fn of(value: f64) -> Self;

    fn as_f64(self) -> f64;
}

impl Sample for f32 {
    const PRECISION: Precision = Precision::Float;

    #[inline]
    fn of(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for f64 {
    const PRECISION: Precision = Precision::Double;

    #[inline]
    fn of(value: f64) -> Self {
        value
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

/// Options for the emulated host platform.
#[derive(Debug, Clone)]
pub struct HostDeviceOptions {
    /// Global memory reported by (and enforced on) the host device.
    pub global_memory: u64,
    pub compute_units: usize,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        Self {
            global_memory: 1024 * 1024 * 1024,
            compute_units: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub global_memory: u64,
    pub max_allocation: u64,
    pub compute_units: usize,
    pub double_support: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
}

impl Platform {
    /// List the available platforms. The host platform is always present.
    pub fn enumerate(options: &HostDeviceOptions) -> Vec<Platform> {
        let version = format!("HostCL {}", env!("CARGO_PKG_VERSION"));
        vec![Platform {
            name: "Host Emulation".to_string(),
            vendor: "EEGView".to_string(),
            version: version.clone(),
            devices: vec![DeviceInfo {
                name: "Host CPU".to_string(),
                vendor: "EEGView".to_string(),
                version,
                global_memory: options.global_memory,
                max_allocation: options.global_memory,
                compute_units: options.compute_units.max(1),
                double_support: true,
            }],
        }]
    }
}

/// Identifies a device as the (platform, device) index pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub platform: usize,
    pub device: usize,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform, self.device)
    }
}

/// Handle to one compute device.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    info: DeviceInfo,
    allocated: AtomicU64,
    compile_count: AtomicUsize,
}

impl Device {
    /// Open the device `device` of platform `platform`.
    pub fn open(platform: usize, device: usize, options: &HostDeviceOptions) -> Result<Arc<Self>> {
        let platforms = Platform::enumerate(options);
        let selected = platforms.get(platform).ok_or_else(|| {
            ComputeError::device(
                DeviceStatus::InvalidPlatform,
                format!("select platform {} of {}", platform, platforms.len()),
            )
        })?;
        let info = selected.devices.get(device).cloned().ok_or_else(|| {
            ComputeError::device(
                DeviceStatus::InvalidDevice,
                format!("select device {} of {}", device, selected.devices.len()),
            )
        })?;

        log::info!(
            "Opened device '{}' on platform '{}' ({} MiB global memory)",
            info.name,
            selected.name,
            info.global_memory / (1024 * 1024)
        );

        Ok(Arc::new(Self {
            id: DeviceId { platform, device },
            info,
            allocated: AtomicU64::new(0),
            compile_count: AtomicUsize::new(0),
        }))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// String that changes whenever compiled binaries stop being portable.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}", self.info.vendor, self.info.name, self.info.version)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> u64 {
        self.info.global_memory.saturating_sub(self.allocated_bytes())
    }

    /// Number of source compilations performed on this device.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Acquire)
    }

    pub(crate) fn record_compile(&self) {
        self.compile_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 || bytes > self.info.max_allocation {
            return Err(ComputeError::device(
                DeviceStatus::InvalidBufferSize,
                format!("allocate buffer of {} bytes", bytes),
            ));
        }

        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.info.global_memory {
                return Err(ComputeError::device(
                    DeviceStatus::MemObjectAllocationFailure,
                    format!(
                        "allocate buffer of {} bytes ({} of {} bytes in use)",
                        bytes, current, self.info.global_memory
                    ),
                ));
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release(&self, bytes: u64) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device() -> Arc<Device> {
        let options = HostDeviceOptions {
            global_memory: 1024,
            compute_units: 2,
        };
        Device::open(0, 0, &options).unwrap()
    }

    #[test]
    fn test_invalid_indices_are_rejected() {
        let options = HostDeviceOptions::default();
        let err = Device::open(3, 0, &options).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Device {
                status: DeviceStatus::InvalidPlatform,
                ..
            }
        ));
        let err = Device::open(0, 5, &options).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Device {
                status: DeviceStatus::InvalidDevice,
                ..
            }
        ));
    }

    #[test]
    fn test_memory_budget_is_enforced() {
        let device = small_device();
        device.reserve(1000).unwrap();
        assert_eq!(device.available_bytes(), 24);
        assert!(device.reserve(100).is_err());
        device.release(1000);
        assert_eq!(device.allocated_bytes(), 0);
        assert!(device.reserve(0).is_err());
    }

    #[test]
    fn test_precision_type_names_round_trip() {
        for precision in [Precision::Float, Precision::Double] {
            assert_eq!(Precision::from_type_name(precision.type_name()), Some(precision));
        }
        assert_eq!(Precision::Double.element_size(), 8);
        assert_eq!(<f32 as Sample>::PRECISION, Precision::Float);
    }
}

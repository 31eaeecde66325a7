pub mod block_cache;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod filter;
pub mod montage;
pub mod profiling;
pub mod reader;

pub use block_cache::{block_index_to_sample_range, CacheStats, GpuCache};
pub use config::EngineConfig;
pub use context::ComputeContext;
pub use device::{CommandQueue, Device, DeviceBuffer, Event, Platform, Precision, Sample};
pub use error::{ComputeError, DeviceStatus, Result, TransformStatus};
pub use filter::{FftFilter, FilterDesign, WindowFunction};
pub use montage::{build_montages, Montage, MontageKind, MontageProcessor};
pub use reader::{MemoryReader, SampleReader};

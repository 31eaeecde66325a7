use crate::config::EngineConfig;
use crate::device::{Device, DeviceInfo, Kernel, Precision};
use crate::error::{ComputeError, DeviceStatus, Result};
use crate::montage::cache::{BinaryCache, KernelCache};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Singleton {
    Identity,
    Copy,
}

/// Root owner of the compute device and the kernel caches.
///
/// Block caches, filters and montages hold `Arc` handles to the device and
/// kernels. The persistent kernel cache is written when the context drops.
pub struct ComputeContext {
    device: Arc<Device>,
    config: EngineConfig,
    singletons: Mutex<HashMap<(Singleton, Precision), Arc<Kernel>>>,
    kernel_cache: KernelCache,
    binary_cache: Option<Mutex<BinaryCache>>,
    compile_pool: rayon::ThreadPool,
}

impl ComputeContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let device = Device::open(config.platform, config.device, &config.host_device_options())?;
        if config.precision == Precision::Double && !device.info().double_support {
            return Err(ComputeError::device(
                DeviceStatus::InvalidDevice,
                format!("select double precision on '{}'", device.info().name),
            ));
        }

        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let threads = config.compile_threads.unwrap_or(hardware).clamp(1, hardware);
        let compile_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("eegview-compile-{}", i))
            .build()
            .map_err(|e| ComputeError::InvalidParameter(format!("compile pool: {}", e)))?;

        let binary_cache = if config.kernel_cache_persistent {
            let path = config
                .resolved_cache_dir()
                .join(BinaryCache::file_name(device.id()));
            let capacity = config.kernel_cache_persistent_size;
            let cache = BinaryCache::load(&path, capacity).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable kernel cache {:?}: {}", path, e);
                BinaryCache::new(&path, capacity)
            });
            Some(Mutex::new(cache))
        } else {
            None
        };

        log::info!(
            "Compute context ready: device {} ({}), {} precision, {} compile threads",
            device.id(),
            device.info().name,
            config.precision,
            threads
        );

        Ok(Self {
            kernel_cache: KernelCache::new(config.kernel_cache_size),
            device,
            config,
            singletons: Mutex::new(HashMap::new()),
            binary_cache,
            compile_pool,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn precision(&self) -> Precision {
        self.config.precision
    }

    /// The shared `out = in(INDEX)` kernel for `precision`.
    pub fn identity_kernel(&self, precision: Precision) -> Arc<Kernel> {
        self.singleton(Singleton::Identity, precision)
    }

    /// The shared `out = in(k)` kernel for `precision`.
    pub fn copy_kernel(&self, precision: Precision) -> Arc<Kernel> {
        self.singleton(Singleton::Copy, precision)
    }

    fn singleton(&self, kind: Singleton, precision: Precision) -> Arc<Kernel> {
        let mut singletons = self.singletons.lock();
        Arc::clone(singletons.entry((kind, precision)).or_insert_with(|| {
            log::debug!("Creating {:?} kernel for {} precision", kind, precision);
            Arc::new(match kind {
                Singleton::Identity => Kernel::identity(precision),
                Singleton::Copy => Kernel::copy(precision),
            })
        }))
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernel_cache
    }

    /// The persistent binary cache, if enabled.
    pub fn binary_cache(&self) -> Option<&Mutex<BinaryCache>> {
        self.binary_cache.as_ref()
    }

    pub fn binary_cache_path(&self) -> Option<PathBuf> {
        self.binary_cache
            .as_ref()
            .map(|cache| cache.lock().path().to_path_buf())
    }

    pub(crate) fn compile_pool(&self) -> &rayon::ThreadPool {
        &self.compile_pool
    }

    pub fn compile_threads(&self) -> usize {
        self.compile_pool.current_num_threads()
    }

    /// Device memory the block cache may use: what the device has left,
    /// capped by the configured limit.
    pub fn available_cache_memory(&self) -> u64 {
        let available = self.device.available_bytes();
        match self.config.gpu_memory_limit() {
            Some(limit) => available.min(limit),
            None => available,
        }
    }

    /// Write the persistent kernel cache if it changed.
    pub fn persist_kernel_cache(&self) -> Result<()> {
        if let Some(cache) = &self.binary_cache {
            let mut cache = cache.lock();
            if cache.is_dirty() {
                cache.save()?;
                log::debug!("Saved {} kernel binaries to {:?}", cache.len(), cache.path());
            }
        }
        Ok(())
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        if let Err(e) = self.persist_kernel_cache() {
            log::warn!("Failed to save kernel cache: {}", e);
        }
    }
}

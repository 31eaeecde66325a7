//! Device-resident cache of signal blocks.
//!
//! A block is `block_size` samples of every channel, stored as one row per
//! channel with a stride of `block_size + 2` so the filter can transform it
//! in place. Slots are allocated once; a miss reuses the least recently used
//! slot.

use crate::context::ComputeContext;
use crate::device::{CommandQueue, Device, DeviceBuffer, Event, EventStatus, Sample};
use crate::error::{ComputeError, Result};
use crate::filter::FftFilter;
use crate::profile_scope;
use crate::reader::SampleReader;
use std::collections::HashMap;
use std::sync::Arc;

/// Inclusive sample range of block `index` when blocks of `block_size`
/// samples overlap by one sample.
pub fn block_index_to_sample_range(index: i64, block_size: usize) -> (i64, i64) {
    let size = block_size as i64;
    (index * size - index, (index + 1) * size - 1 - index)
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub capacity: usize,
    pub cached: usize,
}

pub struct GpuCache<T: Sample> {
    block_size: usize,
    overlap_offset: usize,
    filter_delay: usize,
    channels: usize,
    bytes_per_block: usize,
    reader: Arc<dyn SampleReader<T>>,
    filter: Option<FftFilter<T>>,
    device: Arc<Device>,
    queue: CommandQueue,
    staging: DeviceBuffer<T>,
    slots: Vec<DeviceBuffer<T>>,
    slot_block: Vec<Option<i64>>,
    block_slot: HashMap<i64, usize>,
    last_used: Vec<u64>,
    /// Slot indices from least to most recently used.
    order: Vec<usize>,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl<T: Sample> GpuCache<T> {
    /// Allocate as many slots as fit in `available_memory` bytes, plus one
    /// staging buffer.
    ///
    /// `overlap_offset` samples preceding each nominal block are loaded as
    /// well, and reads are shifted forward by `filter_delay` samples; with a
    /// filter these are its discard and delay counts.
    pub fn new(
        block_size: usize,
        overlap_offset: usize,
        filter_delay: usize,
        available_memory: u64,
        reader: Arc<dyn SampleReader<T>>,
        context: &ComputeContext,
        filter: Option<FftFilter<T>>,
    ) -> Result<Self> {
        let channels = reader.channel_count();
        if block_size < 2 || channels == 0 {
            return Err(ComputeError::InvalidParameter(format!(
                "cannot cache blocks of {} samples x {} channels",
                block_size, channels
            )));
        }
        if overlap_offset >= block_size - 1 {
            return Err(ComputeError::InvalidParameter(format!(
                "overlap offset {} leaves no samples in blocks of {}",
                overlap_offset, block_size
            )));
        }
        if let Some(filter) = &filter {
            if filter.block_length() != block_size || filter.channels() != channels {
                return Err(ComputeError::InvalidParameter(format!(
                    "filter shaped {}x{} for blocks of {}x{}",
                    filter.block_length(),
                    filter.channels(),
                    block_size,
                    channels
                )));
            }
        }

        let bytes_per_block = (block_size + 2) * channels * std::mem::size_of::<T>();
        let capacity = (available_memory / bytes_per_block as u64) as usize;
        if capacity == 0 {
            return Err(ComputeError::ResourceExhausted {
                bytes_per_block,
                available: available_memory,
            });
        }

        let device = Arc::clone(context.device());
        let staging = DeviceBuffer::new(&device, bytes_per_block)?;
        let slots = (0..capacity)
            .map(|_| DeviceBuffer::new(&device, bytes_per_block))
            .collect::<Result<Vec<_>>>()?;
        let queue = CommandQueue::new(&device)?;

        log::info!(
            "Block cache: {} slots of {} bytes ({} samples x {} channels, {})",
            capacity,
            bytes_per_block,
            block_size,
            channels,
            if filter.is_some() { "filtered" } else { "raw" }
        );

        Ok(Self {
            block_size,
            overlap_offset,
            filter_delay,
            channels,
            bytes_per_block,
            reader,
            filter,
            device,
            queue,
            staging,
            slots,
            slot_block: vec![None; capacity],
            block_slot: HashMap::new(),
            last_used: vec![0; capacity],
            order: (0..capacity).collect(),
            clock: 0,
            hits: 0,
            misses: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes_per_block(&self) -> usize {
        self.bytes_per_block
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Elements between the starts of consecutive channel rows.
    pub fn row_stride(&self) -> usize {
        self.block_size + 2
    }

    /// Samples a block advances over its predecessor.
    pub fn block_step(&self) -> usize {
        self.block_size - self.overlap_offset - 1
    }

    pub fn overlap_offset(&self) -> usize {
        self.overlap_offset
    }

    pub fn filter_delay(&self) -> usize {
        self.filter_delay
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn filter(&self) -> Option<&FftFilter<T>> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            capacity: self.capacity(),
            cached: self.block_slot.len(),
        }
    }

    /// Slot holding block `index`, if cached.
    pub fn slot_of(&self, index: i64) -> Option<usize> {
        self.block_slot.get(&index).copied()
    }

    /// Cached block indices from least to most recently used.
    pub fn cached_blocks(&self) -> Vec<i64> {
        self.order
            .iter()
            .filter_map(|&slot| self.slot_block[slot])
            .collect()
    }

    /// Samples of block `index` read from the reader: the nominal range
    /// widened by the overlap offset and shifted by the filter delay.
    pub fn read_window(&self, index: i64) -> (i64, i64) {
        let (first, last) =
            block_index_to_sample_range(index, self.block_size - self.overlap_offset);
        let delay = self.filter_delay as i64;
        (first - self.overlap_offset as i64 + delay, last + delay)
    }

    /// Copy any one of `candidates` into `destination` and return its index.
    ///
    /// A cached candidate is preferred; otherwise the first candidate is
    /// loaded into the least recently used slot. Returns once the work is
    /// enqueued; `ready` completes when `destination` holds the block.
    pub fn get_any(
        &mut self,
        candidates: &[i64],
        destination: &DeviceBuffer<T>,
        ready: &Event,
    ) -> Result<i64> {
        let Some(&first) = candidates.first() else {
            return Err(ComputeError::InvalidParameter(
                "no candidate blocks requested".to_string(),
            ));
        };
        ComputeError::check_size("block destination", self.bytes_per_block, destination.size_bytes())?;

        let cached = candidates
            .iter()
            .find_map(|index| self.block_slot.get(index).map(|&slot| (*index, slot)));

        let (index, slot) = match cached {
            Some(hit) => {
                self.hits += 1;
                log::debug!("Block {} served from slot {}", hit.0, hit.1);
                hit
            }
            None => {
                self.misses += 1;
                let slot = self.order[0];
                if let Some(evicted) = self.slot_block[slot].take() {
                    self.block_slot.remove(&evicted);
                    log::debug!("Evicting block {} from slot {}", evicted, slot);
                }
                self.load(first, slot)?;
                self.slot_block[slot] = Some(first);
                self.block_slot.insert(first, slot);
                (first, slot)
            }
        };

        let len = self.row_stride() * self.channels;
        let copied = self
            .queue
            .enqueue_copy(&self.slots[slot], destination, 0, 0, len)?;
        let ready = ready.clone();
        copied.on_complete(move |status| match status {
            EventStatus::Failed => ready.fail(),
            _ => ready.complete(),
        });

        self.touch(slot);
        Ok(index)
    }

    fn load(&mut self, index: i64, slot: usize) -> Result<()> {
        profile_scope!("load block", index);
        let (first, last) = self.read_window(index);
        let length = self.block_size;

        let mut raw = vec![T::default(); length * self.channels];
        self.reader.read_signal(&mut raw, first, last)?;

        let stride = self.row_stride();
        let mut staged = vec![T::default(); stride * self.channels];
        for (row, samples) in staged.chunks_mut(stride).zip(raw.chunks(length)) {
            row[..length].copy_from_slice(samples);
        }
        self.queue.enqueue_write(&self.staging, 0, staged)?;

        match self.filter.as_mut() {
            Some(filter) => {
                filter.process(&self.staging, &self.slots[slot], &self.queue)?;
            }
            None => {
                self.queue
                    .enqueue_copy(&self.staging, &self.slots[slot], 0, 0, stride * self.channels)?;
            }
        }
        log::debug!("Block {} (samples {}..={}) staged into slot {}", index, first, last, slot);
        Ok(())
    }

    fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.last_used[slot] = self.clock;
        let last_used = &self.last_used;
        self.order.sort_by_key(|&s| last_used[s]);
    }

    /// Forget every cached block.
    pub fn clear(&mut self) {
        self.block_slot.clear();
        self.slot_block.iter_mut().for_each(|b| *b = None);
        log::debug!("Block cache cleared");
    }

    /// Change the filter and drop blocks filtered with the old settings.
    pub fn update_filter<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut FftFilter<T>) -> Result<()>,
    {
        let filter = self.filter.as_mut().ok_or_else(|| {
            ComputeError::InvalidParameter("block cache has no filter".to_string())
        })?;
        update(filter)?;
        self.clear();
        Ok(())
    }

    /// Change the read window shift and drop every cached block.
    pub fn set_offsets(&mut self, overlap_offset: usize, filter_delay: usize) -> Result<()> {
        if overlap_offset >= self.block_size - 1 {
            return Err(ComputeError::InvalidParameter(format!(
                "overlap offset {} leaves no samples in blocks of {}",
                overlap_offset, self.block_size
            )));
        }
        self.overlap_offset = overlap_offset;
        self.filter_delay = filter_delay;
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::reader::MemoryReader;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ComputeContext {
        ComputeContext::new(EngineConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            host_device_memory_mb: 16,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    fn reader() -> Arc<dyn SampleReader<f32>> {
        Arc::new(MemoryReader::<f32>::from_fn(2, 64, 100.0, |c, i| {
            (c * 1000 + i) as f64
        }))
    }

    #[test]
    fn test_ranges_share_one_sample() {
        assert_eq!(block_index_to_sample_range(0, 8), (0, 7));
        assert_eq!(block_index_to_sample_range(1, 8), (7, 14));
        assert_eq!(block_index_to_sample_range(-1, 8), (-7, 0));
    }

    #[test]
    fn test_zero_capacity_is_resource_exhaustion() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let err = GpuCache::new(8, 0, 0, 79, reader(), &context, None)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ComputeError::ResourceExhausted {
                bytes_per_block: 80,
                available: 79
            }
        ));
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let mut cache = GpuCache::new(8, 0, 0, 160, reader(), &context, None).unwrap();
        assert_eq!(cache.capacity(), 2);

        let destination = DeviceBuffer::<f32>::with_len(context.device(), 20).unwrap();
        let ready = Event::user();
        assert_eq!(cache.get_any(&[1], &destination, &ready).unwrap(), 1);
        ready.wait().unwrap();

        let block = cache.queue().read_buffer(&destination, 0, 20).unwrap();
        assert_eq!(&block[..8], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0]);
        assert_eq!(&block[8..10], &[0.0, 0.0]);
        assert_eq!(block[10], 1007.0);

        let ready = Event::user();
        assert_eq!(cache.get_any(&[5, 1], &destination, &ready).unwrap(), 1);
        ready.wait().unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_read_window_includes_overlap_and_delay() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let cache = GpuCache::new(8, 3, 1, 160, reader(), &context, None).unwrap();
        // nominal step 5: block 2 covers 8..=12
        assert_eq!(cache.read_window(2), (6, 13));
        assert_eq!(cache.read_window(0), (-2, 5));
    }

    #[test]
    fn test_invalid_requests() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let mut cache = GpuCache::new(8, 0, 0, 160, reader(), &context, None).unwrap();
        let ready = Event::user();

        let destination = DeviceBuffer::<f32>::with_len(context.device(), 20).unwrap();
        assert!(matches!(
            cache.get_any(&[], &destination, &ready),
            Err(ComputeError::InvalidParameter(_))
        ));

        let short = DeviceBuffer::<f32>::new(context.device(), 79).unwrap();
        let submitted = cache.queue().submitted_commands();
        assert!(matches!(
            cache.get_any(&[0], &short, &ready),
            Err(ComputeError::Size { .. })
        ));
        assert_eq!(cache.queue().submitted_commands(), submitted);
        assert!(cache.update_filter(|_| Ok(())).is_err());
    }
}

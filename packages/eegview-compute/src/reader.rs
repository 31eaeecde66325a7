use crate::device::Sample;
use crate::error::{ComputeError, Result};

/// Source of raw multichannel samples for the block cache.
pub trait SampleReader<T: Sample>: Send + Sync {
    fn channel_count(&self) -> usize;

    /// Samples per channel in the recording.
    fn sample_count(&self) -> u64;

    /// Sampling rate in Hz
    fn sample_rate(&self) -> f64;

    /// Channel labels, used to resolve quoted names in montages.
    fn labels(&self) -> Vec<String> {
        (0..self.channel_count()).map(|i| format!("Ch{}", i + 1)).collect()
    }

    /// Fill `buffer` with samples `first..=last` of every channel, channel
    /// after channel. Samples outside the recording read as zero, so
    /// `first` may be negative.
    fn read_signal(&self, buffer: &mut [T], first: i64, last: i64) -> Result<()>;
}

/// Reader over channels held in memory.
#[derive(Debug, Clone)]
pub struct MemoryReader<T: Sample> {
    channels: Vec<Vec<T>>,
    labels: Vec<String>,
    sample_rate: f64,
}

impl<T: Sample> MemoryReader<T> {
    pub fn new(channels: Vec<Vec<T>>, sample_rate: f64) -> Result<Self> {
        let samples = channels.first().map(Vec::len).unwrap_or(0);
        if let Some(i) = channels.iter().position(|c| c.len() != samples) {
            return Err(ComputeError::InvalidParameter(format!(
                "channel {} has {} samples, expected {}",
                i,
                channels[i].len(),
                samples
            )));
        }
        let labels = (0..channels.len()).map(|i| format!("Ch{}", i + 1)).collect();
        Ok(Self {
            channels,
            labels,
            sample_rate,
        })
    }

    /// Generate `channels` channels of `samples` samples from `f(channel, sample)`.
    pub fn from_fn<F>(channels: usize, samples: usize, sample_rate: f64, f: F) -> Self
    where
        F: Fn(usize, usize) -> f64,
    {
        let data = (0..channels)
            .map(|c| (0..samples).map(|i| T::of(f(c, i))).collect())
            .collect();
        Self {
            channels: data,
            labels: (0..channels).map(|i| format!("Ch{}", i + 1)).collect(),
            sample_rate,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.channels.len() {
            return Err(ComputeError::InvalidParameter(format!(
                "{} labels for {} channels",
                labels.len(),
                self.channels.len()
            )));
        }
        self.labels = labels;
        Ok(self)
    }
}

impl<T: Sample> SampleReader<T> for MemoryReader<T> {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn sample_count(&self) -> u64 {
        self.channels.first().map(|c| c.len() as u64).unwrap_or(0)
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn read_signal(&self, buffer: &mut [T], first: i64, last: i64) -> Result<()> {
        if last < first {
            return Err(ComputeError::InvalidParameter(format!(
                "read range {}..={} is empty",
                first, last
            )));
        }
        let length = (last - first + 1) as usize;
        ComputeError::check_size(
            "read buffer",
            length * self.channels.len() * std::mem::size_of::<T>(),
            std::mem::size_of_val(buffer),
        )?;

        for (channel, row) in self.channels.iter().zip(buffer.chunks_mut(length)) {
            for (i, value) in row.iter_mut().enumerate() {
                let sample = first + i as i64;
                *value = if sample >= 0 {
                    channel.get(sample as usize).copied().unwrap_or_default()
                } else {
                    T::default()
                };
            }
        }
        Ok(())
    }
}

use super::{Montage, MontageKind};
use crate::device::{CommandQueue, DeviceBuffer, Event, MontageArgs, Sample};
use crate::error::{ComputeError, DeviceStatus, Result};
use std::sync::Arc;

/// Dispatches a montage set over a block of input rows.
///
/// Output channel `c` of a row of length `n` is written to elements
/// `(c * n + i) * copies + j` for sample `i` and duplicate `j`.
#[derive(Debug, Clone)]
pub struct MontageProcessor {
    input_row_length: usize,
    input_channels: usize,
    output_copies: usize,
    positions: Arc<Vec<[f64; 3]>>,
}

impl MontageProcessor {
    pub fn new(input_row_length: usize, input_channels: usize, output_copies: usize) -> Result<Self> {
        if output_copies == 0 {
            return Err(ComputeError::InvalidParameter(
                "output copy count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            input_row_length,
            input_channels,
            output_copies,
            positions: Arc::new(Vec::new()),
        })
    }

    /// Electrode coordinates for the `x`, `y` and `z` accessors, one per
    /// input channel.
    pub fn set_positions(&mut self, positions: Vec<[f64; 3]>) {
        self.positions = Arc::new(positions);
    }

    pub fn input_row_length(&self) -> usize {
        self.input_row_length
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_copies(&self) -> usize {
        self.output_copies
    }

    /// Enqueue one dispatch per montage. Every argument is checked before
    /// the first dispatch; the returned marker completes after the last.
    pub fn process<T: Sample>(
        &self,
        montages: &[Montage],
        input: &DeviceBuffer<T>,
        output: &DeviceBuffer<T>,
        queue: &CommandQueue,
        output_row_length: usize,
        input_row_offset: usize,
    ) -> Result<Event> {
        let element = std::mem::size_of::<T>();

        if input.same_buffer(output) {
            return Err(ComputeError::InvalidParameter(
                "montage input and output must be different buffers".to_string(),
            ));
        }
        ComputeError::check_size(
            "montage input",
            self.input_row_length * self.input_channels * element,
            input.size_bytes(),
        )?;
        ComputeError::check_size(
            "montage output",
            output_row_length * montages.len() * self.output_copies * element,
            output.size_bytes(),
        )?;
        if input_row_offset + output_row_length > self.input_row_length {
            return Err(ComputeError::Size {
                what: "montage input row window".to_string(),
                required: (input_row_offset + output_row_length) * element,
                actual: self.input_row_length * element,
            });
        }
        if let Some(montage) = montages.iter().find(|m| m.precision() != T::PRECISION) {
            return Err(ComputeError::device(
                DeviceStatus::InvalidKernelArgs,
                format!(
                    "dispatch {} montage '{}' on {} buffers",
                    montage.precision(),
                    montage.source(),
                    T::PRECISION
                ),
            ));
        }

        for (index, montage) in montages.iter().enumerate() {
            let args = MontageArgs {
                input_row_length: self.input_row_length,
                input_row_offset,
                input_channels: self.input_channels,
                output_row_length,
                output_index: index,
                output_copies: self.output_copies,
                copy_source: match montage.kind() {
                    MontageKind::Copy(channel) => channel,
                    _ => 0,
                },
            };
            montage
                .kernel()
                .enqueue(queue, input, output, args, Arc::clone(&self.positions))?;
        }

        queue.enqueue_marker()
    }
}

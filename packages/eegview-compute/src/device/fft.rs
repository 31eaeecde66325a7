use super::{CommandQueue, DeviceBuffer, Event, Sample};
use crate::error::{ComputeError, Result, TransformStatus};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Batched real <-> complex transform plan.
///
/// Rows are laid out with a stride of `length + 2` elements so that the
/// packed half spectrum (`length / 2 + 1` interleaved complex values) fits
/// in place of the real input.
#[derive(Clone)]
pub struct FftPlan<T: Sample> {
    length: usize,
    batch: usize,
    forward: Arc<dyn Fft<T>>,
    inverse: Arc<dyn Fft<T>>,
}

impl<T: Sample> FftPlan<T> {
    pub fn new(length: usize, batch: usize) -> Result<Self> {
        if length < 2 || length % 2 != 0 {
            return Err(ComputeError::transform(
                TransformStatus::InvalidLength,
                format!("plan real transform of length {}", length),
            ));
        }
        if batch == 0 {
            return Err(ComputeError::transform(
                TransformStatus::InvalidBatch,
                "plan real transform with empty batch",
            ));
        }

        let mut planner = FftPlanner::<T>::new();
        Ok(Self {
            length,
            batch,
            forward: planner.plan_fft_forward(length),
            inverse: planner.plan_fft_inverse(length),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn row_stride(&self) -> usize {
        self.length + 2
    }

    /// Elements a buffer must hold to be used with this plan.
    pub fn required_len(&self) -> usize {
        self.row_stride() * self.batch
    }

    fn check_buffer(&self, buffer: &DeviceBuffer<T>, operation: &str) -> Result<()> {
        if buffer.len() < self.required_len() {
            return Err(ComputeError::transform(
                TransformStatus::BufferTooSmall,
                format!(
                    "{}: {} elements required, {} available",
                    operation,
                    self.required_len(),
                    buffer.len()
                ),
            ));
        }
        Ok(())
    }

    /// Forward real -> packed complex transform of every row. `input` and
    /// `output` may be the same buffer.
    pub fn enqueue_forward(
        &self,
        queue: &CommandQueue,
        input: &DeviceBuffer<T>,
        output: &DeviceBuffer<T>,
    ) -> Result<Event> {
        self.check_buffer(input, "forward transform input")?;
        self.check_buffer(output, "forward transform output")?;

        let plan = self.clone();
        let input = input.clone();
        let output = output.clone();
        queue.submit("forward fft", move || {
            if input.same_buffer(&output) {
                let mut data = output.storage().write();
                for row in 0..plan.batch {
                    let start = row * plan.row_stride();
                    let spectrum = plan.forward_row(&data[start..start + plan.length]);
                    plan.pack_row(&spectrum, &mut data[start..start + plan.row_stride()]);
                }
            } else {
                let source = input.storage().read();
                let mut destination = output.storage().write();
                for row in 0..plan.batch {
                    let start = row * plan.row_stride();
                    let spectrum = plan.forward_row(&source[start..start + plan.length]);
                    plan.pack_row(&spectrum, &mut destination[start..start + plan.row_stride()]);
                }
            }
            Ok(())
        })
    }

    /// Inverse packed complex -> real transform of every row, in place,
    /// scaled by `1 / length`.
    pub fn enqueue_inverse(&self, queue: &CommandQueue, buffer: &DeviceBuffer<T>) -> Result<Event> {
        self.check_buffer(buffer, "inverse transform buffer")?;

        let plan = self.clone();
        let buffer = buffer.clone();
        queue.submit("inverse fft", move || {
            let mut data = buffer.storage().write();
            for row in 0..plan.batch {
                let start = row * plan.row_stride();
                plan.inverse_row(&mut data[start..start + plan.row_stride()]);
            }
            Ok(())
        })
    }

    fn forward_row(&self, samples: &[T]) -> Vec<Complex<T>> {
        let mut spectrum: Vec<Complex<T>> = samples
            .iter()
            .map(|&x| Complex::new(x, T::default()))
            .collect();
        self.forward.process(&mut spectrum);
        spectrum
    }

    fn pack_row(&self, spectrum: &[Complex<T>], row: &mut [T]) {
        for k in 0..=self.length / 2 {
            row[2 * k] = spectrum[k].re;
            row[2 * k + 1] = spectrum[k].im;
        }
    }

    fn inverse_row(&self, row: &mut [T]) {
        let n = self.length;
        let half = n / 2;
        let mut spectrum = vec![Complex::new(T::default(), T::default()); n];
        for k in 0..=half {
            spectrum[k] = Complex::new(row[2 * k], row[2 * k + 1]);
        }
        for k in half + 1..n {
            spectrum[k] = spectrum[n - k].conj();
        }
        // Imaginary parts of DC and Nyquist carry no information for real signals.
        spectrum[0].im = T::default();
        spectrum[half].im = T::default();

        self.inverse.process(&mut spectrum);

        let scale = T::of(1.0 / n as f64);
        for (value, bin) in row.iter_mut().zip(spectrum.iter()) {
            *value = bin.re * scale;
        }
        row[n] = T::default();
        row[n + 1] = T::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, HostDeviceOptions};

    #[test]
    fn test_invalid_plans_are_rejected() {
        assert!(matches!(
            FftPlan::<f32>::new(7, 1),
            Err(ComputeError::Transform {
                status: TransformStatus::InvalidLength,
                ..
            })
        ));
        assert!(matches!(
            FftPlan::<f32>::new(8, 0),
            Err(ComputeError::Transform {
                status: TransformStatus::InvalidBatch,
                ..
            })
        ));
    }

    #[test]
    fn test_forward_then_inverse_restores_rows() {
        let device = Device::open(0, 0, &HostDeviceOptions::default()).unwrap();
        let queue = CommandQueue::new(&device).unwrap();
        let plan = FftPlan::<f64>::new(8, 2).unwrap();
        let input = DeviceBuffer::<f64>::with_len(&device, plan.required_len()).unwrap();
        let output = DeviceBuffer::<f64>::with_len(&device, plan.required_len()).unwrap();

        let mut host = vec![0.0; plan.required_len()];
        for row in 0..2 {
            for i in 0..8 {
                host[row * 10 + i] = (i as f64 * 0.7 + row as f64).sin();
            }
        }
        queue.enqueue_write(&input, 0, host.clone()).unwrap();
        plan.enqueue_forward(&queue, &input, &output).unwrap();
        plan.enqueue_inverse(&queue, &output).unwrap();

        let restored = queue.read_buffer(&output, 0, plan.required_len()).unwrap();
        for (a, b) in restored.iter().zip(host.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_dc_bin_holds_the_row_sum() {
        let device = Device::open(0, 0, &HostDeviceOptions::default()).unwrap();
        let queue = CommandQueue::new(&device).unwrap();
        let plan = FftPlan::<f32>::new(4, 1).unwrap();
        let buffer = DeviceBuffer::<f32>::with_len(&device, plan.required_len()).unwrap();

        queue.enqueue_write(&buffer, 0, vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]).unwrap();
        plan.enqueue_forward(&queue, &buffer, &buffer).unwrap();
        let packed = queue.read_buffer(&buffer, 0, 6).unwrap();

        assert!((packed[0] - 10.0).abs() < 1e-5);
        assert!(packed[1].abs() < 1e-5);
        // Nyquist bin: 1 - 2 + 3 - 4
        assert!((packed[4] + 2.0).abs() < 1e-5);
    }
}

//! Frequency-domain FIR filtering of signal blocks.
//!
//! Filter taps are synthesized by frequency sampling and applied to whole
//! blocks as a spectral product: forward transform of every channel row,
//! multiplication by the transformed taps, inverse transform. The product is
//! a circular convolution, so the first `taps - 1` output samples of a block
//! are invalid and the rest are delayed by `(taps - 1) / 2` samples.

use crate::context::ComputeContext;
use crate::device::{CommandQueue, DeviceBuffer, Event, FftPlan, Sample};
use crate::error::{ComputeError, Result};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Window applied to the synthesized taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    #[default]
    None,
    Hamming,
    Blackman,
}

impl WindowFunction {
    /// Window value for tap `n` of `m`.
    pub fn value(self, n: usize, m: usize) -> f64 {
        if m < 2 {
            return 1.0;
        }
        let phase = 2.0 * PI * n as f64 / (m - 1) as f64;
        match self {
            WindowFunction::None => 1.0,
            WindowFunction::Hamming => 0.54 - 0.46 * phase.cos(),
            WindowFunction::Blackman => 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos(),
        }
    }
}

/// FIR filter applied to blocks of `channels` rows on the device.
pub struct FftFilter<T: Sample> {
    block_length: usize,
    channels: usize,
    coefficients: Vec<f64>,
    dirty: bool,
    filter_spectrum: DeviceBuffer<T>,
    filter_plan: FftPlan<T>,
    signal_plan: FftPlan<T>,
}

impl<T: Sample> FftFilter<T> {
    /// Create an all-pass filter (a single unit tap) for blocks of
    /// `block_length` samples per channel. `block_length` must be even.
    pub fn new(context: &ComputeContext, block_length: usize, channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(ComputeError::InvalidParameter(
                "filter needs at least one channel".to_string(),
            ));
        }
        let filter_plan = FftPlan::new(block_length, 1)?;
        let signal_plan = FftPlan::new(block_length, channels)?;
        let filter_spectrum = DeviceBuffer::with_len(context.device(), filter_plan.required_len())?;

        log::debug!(
            "Created {} FFT filter: {} samples x {} channels",
            T::PRECISION,
            block_length,
            channels
        );

        Ok(Self {
            block_length,
            channels,
            coefficients: vec![1.0],
            dirty: true,
            filter_spectrum,
            filter_plan,
            signal_plan,
        })
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes an input or output buffer must hold.
    pub fn required_bytes(&self) -> usize {
        self.signal_plan.required_len() * std::mem::size_of::<T>()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Group delay of the linear-phase taps.
    pub fn delay_samples(&self) -> usize {
        (self.coefficients.len() - 1) / 2
    }

    /// Leading samples of each output row spoiled by wrap-around.
    pub fn discard_samples(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Replace the taps directly.
    pub fn set_coefficients(&mut self, taps: Vec<f64>) -> Result<()> {
        if taps.is_empty() || taps.len() > self.block_length {
            return Err(ComputeError::InvalidParameter(format!(
                "filter needs 1 to {} taps, got {}",
                self.block_length,
                taps.len()
            )));
        }
        self.coefficients = taps;
        self.dirty = true;
        Ok(())
    }

    /// Synthesize `m` taps from `1 + m / 2` samples of the desired magnitude
    /// response, taken at frequencies `k * fs / m`.
    pub fn change_sample_filter(&mut self, m: usize, samples: &[f64]) -> Result<()> {
        if m == 0 || m > self.block_length {
            return Err(ComputeError::InvalidParameter(format!(
                "filter length {} outside 1..={}",
                m, self.block_length
            )));
        }
        if samples.len() != 1 + m / 2 {
            return Err(ComputeError::InvalidParameter(format!(
                "{} response samples given for {} taps, {} expected",
                samples.len(),
                m,
                1 + m / 2
            )));
        }

        let mut spectrum = vec![Complex::new(0.0, 0.0); m];
        for (k, &magnitude) in samples.iter().enumerate() {
            let phase = -2.0 * PI * k as f64 * (m - 1) as f64 / (2 * m) as f64;
            spectrum[k] = Complex::from_polar(magnitude, phase);
        }
        for k in m / 2 + 1..m {
            spectrum[k] = spectrum[m - k].conj();
        }

        FftPlanner::<f64>::new()
            .plan_fft_inverse(m)
            .process(&mut spectrum);

        let scale = 1.0 / m as f64;
        self.coefficients = spectrum.iter().map(|c| c.re * scale).collect();
        self.dirty = true;
        Ok(())
    }

    pub fn apply_window(&mut self, window: WindowFunction) {
        let m = self.coefficients.len();
        for (n, tap) in self.coefficients.iter_mut().enumerate() {
            *tap *= window.value(n, m);
        }
        self.dirty = true;
    }

    /// Synthesize taps for `design` and apply its window.
    pub fn design(&mut self, design: &FilterDesign) -> Result<()> {
        let samples = design.response_samples()?;
        self.change_sample_filter(design.taps, &samples)?;
        self.apply_window(design.window);
        Ok(())
    }

    /// Filter every row of `input` into `output`.
    ///
    /// All steps are enqueued without waiting; the returned event completes
    /// when `output` holds the filtered rows.
    pub fn process(
        &mut self,
        input: &DeviceBuffer<T>,
        output: &DeviceBuffer<T>,
        queue: &CommandQueue,
    ) -> Result<Event> {
        if input.same_buffer(output) {
            return Err(ComputeError::InvalidParameter(
                "filter input and output must be different buffers".to_string(),
            ));
        }
        ComputeError::check_size("filter input", self.required_bytes(), input.size_bytes())?;
        ComputeError::check_size("filter output", self.required_bytes(), output.size_bytes())?;

        if self.dirty {
            let taps: Vec<T> = self.coefficients.iter().map(|&c| T::of(c)).collect();
            let pad = self.filter_plan.required_len() - taps.len();
            queue.enqueue_write(&self.filter_spectrum, 0, taps)?;
            queue.enqueue_fill(&self.filter_spectrum, T::default(), self.coefficients.len(), pad)?;
            self.filter_plan
                .enqueue_forward(queue, &self.filter_spectrum, &self.filter_spectrum)?;
            self.dirty = false;
        }

        self.signal_plan.enqueue_forward(queue, input, output)?;

        let filter = self.filter_spectrum.clone();
        let spectra = output.clone();
        let (rows, stride, bins) = (
            self.channels,
            self.signal_plan.row_stride(),
            self.block_length / 2 + 1,
        );
        queue.submit("spectral product", move || {
            let filter = filter.storage().read();
            let mut spectra = spectra.storage().write();
            for row in 0..rows {
                let data = &mut spectra[row * stride..(row + 1) * stride];
                for k in 0..bins {
                    let (a, b) = (data[2 * k], data[2 * k + 1]);
                    let (c, d) = (filter[2 * k], filter[2 * k + 1]);
                    data[2 * k] = a * c - b * d;
                    data[2 * k + 1] = a * d + b * c;
                }
            }
            Ok(())
        })?;

        self.signal_plan.enqueue_inverse(queue, output)
    }
}

fn default_taps() -> usize {
    255
}

fn default_notch_width() -> f64 {
    2.0
}

/// Browser filter settings turned into a magnitude response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDesign {
    /// Sampling rate in Hz
    pub sample_rate: f64,
    #[serde(default = "default_taps")]
    pub taps: usize,
    /// Frequencies above this are removed (Hz)
    #[serde(default)]
    pub lowpass: Option<f64>,
    /// Frequencies below this are removed (Hz)
    #[serde(default)]
    pub highpass: Option<f64>,
    /// Center of the band-stop (Hz), usually the mains frequency
    #[serde(default)]
    pub notch: Option<f64>,
    #[serde(default = "default_notch_width")]
    pub notch_width: f64,
    #[serde(default)]
    pub window: WindowFunction,
}

impl FilterDesign {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            taps: default_taps(),
            lowpass: None,
            highpass: None,
            notch: None,
            notch_width: default_notch_width(),
            window: WindowFunction::None,
        }
    }

    /// The `1 + taps / 2` response samples for
    /// [`FftFilter::change_sample_filter`].
    pub fn response_samples(&self) -> Result<Vec<f64>> {
        self.validate()?;

        let step = self.sample_rate / self.taps as f64;
        let samples = (0..=self.taps / 2)
            .map(|k| {
                let f = k as f64 * step;
                let removed = self.lowpass.is_some_and(|lp| f > lp)
                    || self.highpass.is_some_and(|hp| f < hp)
                    || self
                        .notch
                        .is_some_and(|center| (f - center).abs() <= self.notch_width / 2.0);
                if removed {
                    0.0
                } else {
                    1.0
                }
            })
            .collect();
        Ok(samples)
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate <= 0.0 {
            return Err(ComputeError::InvalidParameter(format!(
                "Sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.taps == 0 {
            return Err(ComputeError::InvalidParameter(
                "Filter needs at least one tap".to_string(),
            ));
        }

        let nyquist = self.sample_rate / 2.0;
        let cutoffs = [
            ("Lowpass", self.lowpass),
            ("Highpass", self.highpass),
            ("Notch", self.notch),
        ];
        for (name, frequency) in cutoffs {
            if let Some(frequency) = frequency {
                if frequency <= 0.0 || frequency >= nyquist {
                    return Err(ComputeError::InvalidParameter(format!(
                        "{} frequency ({} Hz) must be between 0 and Nyquist ({} Hz)",
                        name, frequency, nyquist
                    )));
                }
            }
        }
        if let (Some(low), Some(high)) = (self.highpass, self.lowpass) {
            if low >= high {
                return Err(ComputeError::InvalidParameter(
                    "Highpass cutoff must be less than lowpass cutoff".to_string(),
                ));
            }
        }
        Ok(())
    }
}

use super::{fail, kind_name, read_header, EngineOptions};
use crate::cli::PipelineArgs;
use crate::exit_codes;
use crate::output;
use eegview_compute::profiling::{
    get_profile_log_location, profile_totals, reset_profile_totals, ScopeTotals, PROFILE_LOG_ENV,
};
use eegview_compute::{
    build_montages, CommandQueue, ComputeContext, DeviceBuffer, Event, FftFilter, FilterDesign,
    GpuCache, MemoryReader, MontageProcessor, Precision, Result, Sample, SampleReader,
    WindowFunction,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

#[derive(Serialize)]
struct PipelineOutput {
    device: String,
    precision: Precision,
    channels: usize,
    block_size: usize,
    blocks_requested: usize,
    capacity: usize,
    bytes_per_block: usize,
    hits: u64,
    misses: u64,
    filter: Option<FilterOutput>,
    montages: Vec<MontageOutput>,
    compiles: usize,
    kernel_cache_hits: u64,
    elapsed_ms: f64,
    timings: BTreeMap<&'static str, ScopeTotals>,
}

#[derive(Serialize)]
struct FilterOutput {
    taps: usize,
    delay: usize,
    discard: usize,
}

#[derive(Serialize)]
struct MontageOutput {
    source: String,
    kind: String,
    min: f64,
    max: f64,
    mean: f64,
}

#[derive(Clone)]
struct Summary {
    min: f64,
    max: f64,
    sum: f64,
    count: usize,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }
}

impl Summary {
    fn add<T: Sample>(&mut self, values: &[T]) {
        for value in values.iter().map(|v| v.as_f64()) {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
            self.sum += value;
        }
        self.count += values.len();
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Alpha rhythm, mains interference and a slow drift, offset per channel.
fn synthetic(channel: usize, sample: usize, sample_rate: f64) -> f64 {
    let t = sample as f64 / sample_rate;
    20.0 * (2.0 * PI * 10.0 * t + channel as f64).sin()
        + 5.0 * (2.0 * PI * 50.0 * t).sin()
        + 10.0 * (2.0 * PI * 0.3 * t).sin()
        + channel as f64 * 2.0
}

pub fn execute(args: PipelineArgs, options: &EngineOptions) -> i32 {
    if args.channels == 0 || args.blocks == 0 || args.cache_slots == 0 {
        eprintln!("Error: --channels, --blocks and --cache-slots must be positive");
        return exit_codes::INPUT_ERROR;
    }
    let config = match options.load() {
        Ok(config) => config,
        Err(code) => return code,
    };
    let header = match read_header(args.header.as_deref()) {
        Ok(header) => header,
        Err(code) => return code,
    };
    let context = match ComputeContext::new(config) {
        Ok(context) => context,
        Err(e) => return fail(e),
    };

    reset_profile_totals();
    let started = Instant::now();
    let result = match context.precision() {
        Precision::Float => run::<f32>(&args, &context, &header),
        Precision::Double => run::<f64>(&args, &context, &header),
    };
    let mut summary = match result {
        Ok(summary) => summary,
        Err(e) => return fail(e),
    };
    summary.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    summary.timings = profile_totals();

    if let Err(e) = context.persist_kernel_cache() {
        log::warn!("Failed to save kernel cache: {}", e);
    }

    if args.json {
        return output::print_json(&summary);
    }

    println!(
        "Device {} ({} precision), {} channels, blocks of {} samples",
        summary.device, summary.precision, summary.channels, summary.block_size
    );
    println!(
        "Cache: {} slots of {} bytes, {} hits, {} misses",
        summary.capacity, summary.bytes_per_block, summary.hits, summary.misses
    );
    if let Some(filter) = &summary.filter {
        println!(
            "Filter: {} taps, delay {} samples, {} samples discarded per block",
            filter.taps, filter.delay, filter.discard
        );
    }
    println!(
        "Montages: {} kernels compiled, {} in-memory cache hits",
        summary.compiles, summary.kernel_cache_hits
    );
    println!();
    println!("  {:<10} {:>10} {:>10} {:>10}  Formula", "Kind", "Min", "Max", "Mean");
    for m in &summary.montages {
        println!(
            "  {:<10} {:>10.3} {:>10.3} {:>10.3}  {}",
            m.kind, m.min, m.max, m.mean, m.source
        );
    }
    println!();
    for (name, t) in &summary.timings {
        println!(
            "  {:<16} {:>5} x  {:>9.3} ms total  {:>9.3} ms max",
            name, t.count, t.total_ms, t.max_ms
        );
    }
    println!("Finished in {:.1} ms", summary.elapsed_ms);
    if std::env::var_os(PROFILE_LOG_ENV).is_some() {
        println!("Profile log: {}", get_profile_log_location());
    }

    exit_codes::SUCCESS
}

fn run<T: Sample>(
    args: &PipelineArgs,
    context: &ComputeContext,
    header: &str,
) -> Result<PipelineOutput> {
    let block_size = args.block_size.unwrap_or(context.config().block_size);
    let channels = args.channels;
    let sample_rate = args.sample_rate;

    let reader = Arc::new(MemoryReader::<T>::from_fn(
        channels,
        block_size * args.blocks,
        sample_rate,
        |c, i| synthetic(c, i, sample_rate),
    ));
    let labels = reader.labels();

    let filtered = args.lowpass.is_some() || args.highpass.is_some() || args.notch.is_some();
    let filter = if filtered {
        let mut filter = FftFilter::<T>::new(context, block_size, channels)?;
        filter.design(&FilterDesign {
            taps: args.taps,
            lowpass: args.lowpass,
            highpass: args.highpass,
            notch: args.notch,
            window: WindowFunction::Hamming,
            ..FilterDesign::new(sample_rate)
        })?;
        Some(filter)
    } else {
        None
    };
    let filter_output = filter.as_ref().map(|f| FilterOutput {
        taps: f.coefficients().len(),
        delay: f.delay_samples(),
        discard: f.discard_samples(),
    });
    let (overlap, delay) = filter
        .as_ref()
        .map(|f| (f.discard_samples(), f.delay_samples()))
        .unwrap_or((0, 0));

    let bytes_per_block = (block_size + 2) * channels * std::mem::size_of::<T>();
    let budget = context
        .available_cache_memory()
        .min(args.cache_slots.saturating_mul(bytes_per_block) as u64);
    let source: Arc<dyn SampleReader<T>> = reader;
    let mut cache = GpuCache::new(block_size, overlap, delay, budget, source, context, filter)?;

    let sources = if args.montage.is_empty() {
        vec!["out = in(INDEX);".to_string(); channels]
    } else {
        args.montage.clone()
    };
    let montages = build_montages(context, &sources, &labels, header)?;

    let out_len = block_size - overlap;
    let processor = MontageProcessor::new(cache.row_stride(), channels, 1)?;
    let block = DeviceBuffer::<T>::new(context.device(), bytes_per_block)?;
    let rendered = DeviceBuffer::<T>::with_len(context.device(), out_len * montages.len())?;
    let queue = CommandQueue::new(context.device())?;
    let mut summaries = vec![Summary::default(); montages.len()];

    // forward sweep, then backward so recently loaded blocks can hit
    let requests = (0..args.blocks).chain((0..args.blocks).rev());
    for index in requests {
        let ready = Event::user();
        cache.get_any(&[index as i64], &block, &ready)?;
        ready.wait()?;

        processor
            .process(&montages, &block, &rendered, &queue, out_len, overlap)?
            .wait()?;
        let values = queue.read_buffer(&rendered, 0, out_len * montages.len())?;
        for (summary, row) in summaries.iter_mut().zip(values.chunks(out_len)) {
            summary.add(row);
        }
    }

    let stats = cache.stats();
    log::info!(
        "Pipeline served {} block requests ({} hits, {} misses)",
        stats.hits + stats.misses,
        stats.hits,
        stats.misses
    );

    Ok(PipelineOutput {
        device: context.device_info().name.clone(),
        precision: T::PRECISION,
        channels,
        block_size,
        blocks_requested: 2 * args.blocks,
        capacity: stats.capacity,
        bytes_per_block: cache.bytes_per_block(),
        hits: stats.hits,
        misses: stats.misses,
        filter: filter_output,
        montages: montages
            .iter()
            .zip(&summaries)
            .map(|(montage, summary)| MontageOutput {
                source: montage.source().to_string(),
                kind: kind_name(montage.kind()),
                min: summary.min,
                max: summary.max,
                mean: summary.mean(),
            })
            .collect(),
        compiles: context.device().compile_count(),
        kernel_cache_hits: context.kernel_cache().hits(),
        elapsed_ms: 0.0,
        timings: BTreeMap::new(),
    })
}

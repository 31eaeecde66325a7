use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "eegview",
    version,
    about = "EEG signal cache and montage compute engine",
    long_about = "Inspect compute devices, validate montage formulas, manage the persistent\n\
                  kernel cache and run the block cache / filter / montage pipeline on\n\
                  synthetic data."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "EEGVIEW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of the persistent kernel cache (overrides the config file)
    #[arg(long, global = true, env = "EEGVIEW_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// List compute platforms and devices
    Devices(DevicesArgs),
    /// Check that montage formulas compile
    Validate(ValidateArgs),
    /// Show or clear the persistent kernel cache
    KernelCache(KernelCacheArgs),
    /// Run the block cache, filter and montages over a synthetic recording
    Pipeline(PipelineArgs),
}

#[derive(Args)]
pub struct DevicesArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Montage formula, e.g. 'out = in("Fp1") - in("Cz");'
    #[arg(long, required = true, num_args = 1..)]
    pub montage: Vec<String>,

    /// Channel labels used to resolve quoted names
    #[arg(long, value_delimiter = ',')]
    pub labels: Vec<String>,

    /// File with helper functions prepended to every kernel
    #[arg(long)]
    pub header: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct KernelCacheArgs {
    /// Remove every stored kernel binary
    #[arg(long)]
    pub clear: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct PipelineArgs {
    /// Channels of the synthetic recording
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Blocks to request
    #[arg(long, default_value_t = 8)]
    pub blocks: usize,

    /// Samples per block (defaults to the configured block size)
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Cache slots to allocate at most
    #[arg(long, default_value_t = 16)]
    pub cache_slots: usize,

    /// Sampling rate of the synthetic recording in Hz
    #[arg(long, default_value_t = 256.0)]
    pub sample_rate: f64,

    /// Lowpass cutoff in Hz
    #[arg(long)]
    pub lowpass: Option<f64>,

    /// Highpass cutoff in Hz
    #[arg(long)]
    pub highpass: Option<f64>,

    /// Notch center frequency in Hz
    #[arg(long)]
    pub notch: Option<f64>,

    /// Filter taps
    #[arg(long, default_value_t = 127)]
    pub taps: usize,

    /// Montage formula per output channel (identity of every channel if omitted)
    #[arg(long, num_args = 1..)]
    pub montage: Vec<String>,

    /// File with helper functions prepended to every kernel
    #[arg(long)]
    pub header: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

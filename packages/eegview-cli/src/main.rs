use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;
use commands::EngineOptions;

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let options = EngineOptions {
        config: cli.config,
        cache_dir: cli.cache_dir,
    };

    let exit_code = match cli.command {
        cli::Command::Devices(args) => commands::devices::execute(args, &options),
        cli::Command::Validate(args) => commands::validate::execute(args, &options),
        cli::Command::KernelCache(args) => commands::kernel_cache::execute(args, &options),
        cli::Command::Pipeline(args) => commands::pipeline::execute(args, &options),
    };

    std::process::exit(exit_code);
}

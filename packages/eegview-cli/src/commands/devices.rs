use super::EngineOptions;
use crate::cli::DevicesArgs;
use crate::exit_codes;
use crate::output;
use eegview_compute::Platform;
use serde::Serialize;

#[derive(Serialize)]
struct DeviceOutput {
    platform: usize,
    device: usize,
    platform_name: String,
    name: String,
    vendor: String,
    version: String,
    global_memory_mb: u64,
    compute_units: usize,
    double_support: bool,
    selected: bool,
}

pub fn execute(args: DevicesArgs, options: &EngineOptions) -> i32 {
    let config = match options.load() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let devices: Vec<DeviceOutput> = Platform::enumerate(&config.host_device_options())
        .into_iter()
        .enumerate()
        .flat_map(|(p, platform)| {
            let platform_name = platform.name.clone();
            let selected_platform = p == config.platform;
            platform
                .devices
                .into_iter()
                .enumerate()
                .map(move |(d, info)| DeviceOutput {
                    platform: p,
                    device: d,
                    platform_name: platform_name.clone(),
                    name: info.name,
                    vendor: info.vendor,
                    version: info.version,
                    global_memory_mb: info.global_memory / (1024 * 1024),
                    compute_units: info.compute_units,
                    double_support: info.double_support,
                    selected: selected_platform && d == config.device,
                })
        })
        .collect();

    if args.json {
        return output::print_json(&devices);
    }

    println!("Compute devices:\n");
    println!(
        "    {:<6} {:<20} {:<16} {:>10} {:>6} {:<6}",
        "Index", "Platform", "Device", "Memory", "Units", "Double"
    );
    println!("    {}", "-".repeat(70));
    for d in &devices {
        println!(
            "  {} {:<6} {:<20} {:<16} {:>7} MiB {:>6} {:<6}",
            if d.selected { "*" } else { " " },
            format!("{}-{}", d.platform, d.device),
            d.platform_name,
            d.name,
            d.global_memory_mb,
            d.compute_units,
            if d.double_support { "yes" } else { "no" }
        );
    }
    if !devices.iter().any(|d| d.selected) {
        eprintln!(
            "Warning: configured device {}-{} does not exist",
            config.platform, config.device
        );
    }

    exit_codes::SUCCESS
}

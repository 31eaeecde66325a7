use super::{fail, EngineOptions};
use crate::cli::KernelCacheArgs;
use crate::exit_codes;
use crate::output;
use eegview_compute::device::DeviceId;
use eegview_compute::montage::cache::BinaryCache;
use serde::Serialize;

#[derive(Serialize)]
struct KernelCacheOutput {
    path: String,
    enabled: bool,
    exists: bool,
    count: usize,
    capacity: usize,
    cleared: bool,
    sources: Vec<String>,
}

/// The `kernel montage` body of a stored kernel source.
fn kernel_body(source: &str) -> String {
    let body = match source.find("kernel montage {") {
        Some(start) => &source[start + "kernel montage {".len()..],
        None => source,
    };
    body.trim().trim_end_matches('}').trim().to_string()
}

pub fn execute(args: KernelCacheArgs, options: &EngineOptions) -> i32 {
    let config = match options.load() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let device = DeviceId {
        platform: config.platform,
        device: config.device,
    };
    let path = config
        .resolved_cache_dir()
        .join(BinaryCache::file_name(device));
    let exists = path.exists();

    let mut cache = match BinaryCache::load(&path, config.kernel_cache_persistent_size) {
        Ok(cache) => cache,
        Err(e) => return fail(e),
    };
    if args.clear {
        cache.clear();
        if let Err(e) = cache.save() {
            return fail(e);
        }
        log::info!("Cleared kernel cache {:?}", path);
    }

    let result = KernelCacheOutput {
        path: path.display().to_string(),
        enabled: config.kernel_cache_persistent,
        exists: exists || args.clear,
        count: cache.len(),
        capacity: cache.capacity(),
        cleared: args.clear,
        sources: cache.sources().iter().map(|s| kernel_body(s)).collect(),
    };

    if args.json {
        return output::print_json(&result);
    }

    println!("Kernel cache: {}", result.path);
    if !result.enabled {
        println!("  (persistence disabled in config)");
    }
    if args.clear {
        println!("  cleared");
    }
    println!("  {} of {} entries", result.count, result.capacity);
    for source in &result.sources {
        println!("    {}", source);
    }

    exit_codes::SUCCESS
}

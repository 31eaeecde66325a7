use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Environment variable that enables the profile log file.
pub const PROFILE_LOG_ENV: &str = "EEGVIEW_PROFILE";

static TOTALS: Mutex<BTreeMap<&'static str, ScopeTotals>> = Mutex::new(BTreeMap::new());

/// Accumulated timings of every scope sharing a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScopeTotals {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

/// Times a scope until dropped.
///
/// The duration is logged at debug level, added to the process-wide totals
/// under `name`, and appended to the profile log when `EEGVIEW_PROFILE` is
/// set.
pub struct ProfileScope {
    name: &'static str,
    detail: String,
    start: Instant,
}

impl ProfileScope {
    pub fn new(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            detail: detail.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        log::debug!("[PROFILE] {} {} - {:.3}ms", self.name, self.detail, elapsed_ms);

        {
            let mut totals = TOTALS.lock();
            let entry = totals.entry(self.name).or_default();
            entry.count += 1;
            entry.total_ms += elapsed_ms;
            entry.max_ms = entry.max_ms.max(elapsed_ms);
        }

        if std::env::var_os(PROFILE_LOG_ENV).is_some() {
            if let Err(e) = append_line(self.name, &self.detail, elapsed_ms) {
                log::warn!("Failed to write profile log: {}", e);
            }
        }
    }
}

/// Snapshot of the totals recorded so far, by scope name.
pub fn profile_totals() -> BTreeMap<&'static str, ScopeTotals> {
    TOTALS.lock().clone()
}

pub fn reset_profile_totals() {
    TOTALS.lock().clear();
}

fn profile_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("EEGView")
        .join("performance_profile.log")
}

fn append_line(name: &str, detail: &str, duration_ms: f64) -> std::io::Result<()> {
    let path = profile_log_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let timestamp = chrono::Utc::now().to_rfc3339();
    writeln!(
        file,
        "{} | {} | {} | {:.3}ms",
        timestamp, name, detail, duration_ms
    )
}

/// Time the rest of the enclosing block: `profile_scope!("load block", index)`.
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_scope = $crate::profiling::ProfileScope::new($name, String::new());
    };
    ($name:expr, $detail:expr) => {
        let _profile_scope = $crate::profiling::ProfileScope::new($name, $detail.to_string());
    };
}

/// Where profile lines go when `EEGVIEW_PROFILE` is set.
pub fn get_profile_log_location() -> String {
    profile_log_path()
        .to_str()
        .unwrap_or("Unknown")
        .to_string()
}

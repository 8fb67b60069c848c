//! Ambient helpers shared by every component: structured-logging setup, a
//! generic JSON persistence trait, and a linear-backoff retry helper for the
//! places a transient `TransferError` should simply be tried again.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Convert a byte count into a human readable string using IEC units, used in
/// log lines and the archive scanner's per-hour summary.
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Wire up `tracing` to a non-blocking file appender under `<work_dir>/log/`.
/// Mirrors the CLI tool this crate grew from: file output only, no console
/// layer, level gated by `--debug`/`-v`. The writer guard is leaked so the
/// background flush thread survives for the process lifetime.
pub fn init_tracing(log_dir: &Path, debug: bool) {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("warning: could not create log dir {}: {e}", log_dir.display());
        return;
    }
    let log_path = log_dir.join("afd.log");
    let level_str = if debug { "debug" } else { "info" };
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (writer, guard) = non_blocking(file);
            let _ = Box::leak(Box::new(guard));
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open log file {}: {e}", log_path.display());
        }
    }
}

/// Generic JSON-on-disk persistence, used for the daemon's own config and for
/// `ls_data` retrieve-list files that don't need positional mmap access.
/// Never panics: callers see a default/fallback value and a logged warning
/// instead of a propagated error, since losing a non-critical persisted blob
/// should not bring a long-running daemon down.
pub trait StorageObject {
    fn pretty_json(&self) -> String;
    fn save_to<P: AsRef<Path>>(&self, path: P)
    where
        Self: Serialize;
    fn read_from<T: Default + DeserializeOwned + Serialize, P: AsRef<Path>>(path: P) -> T;
}

impl<T: Serialize> StorageObject for T {
    fn pretty_json(&self) -> String {
        match serde_json::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize storage object");
                "{}".to_string()
            }
        }
    }

    fn save_to<P: AsRef<Path>>(&self, path: P) {
        if let Err(e) = std::fs::write(path, self.pretty_json()) {
            tracing::warn!(error = %e, "failed to write storage object");
        }
    }

    fn read_from<R: Default + DeserializeOwned + Serialize, P: AsRef<Path>>(path: P) -> R {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return R::default(),
        };
        match serde_json::from_str::<R>(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse storage object, using default");
                R::default()
            }
        }
    }
}

/// Linear backoff: `base * (attempt + 1)`, matching the teacher's own
/// `retry_operation` cadence rather than introducing exponential jitter
/// where the spec only calls for "small backoff" (§4.D, §7).
pub fn retry_operation<F, T, E>(mut attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                attempts = attempts.saturating_sub(1);
                if attempts == 0 {
                    return Err(e);
                }
                std::thread::sleep(base * (attempt + 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_formats_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn retry_operation_gives_up_after_budget() {
        let mut calls = 0;
        let res: Result<(), &str> = retry_operation(3, Duration::from_millis(1), |_| {
            calls += 1;
            Err("boom")
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_operation_succeeds_eventually() {
        let mut calls = 0;
        let res: Result<i32, &str> = retry_operation(5, Duration::from_millis(1), |attempt| {
            calls += 1;
            if attempt < 2 { Err("not yet") } else { Ok(42) }
        });
        assert_eq!(res, Ok(42));
        assert_eq!(calls, 3);
    }
}

//! The daemon's own configuration: where its work directory lives and the
//! timing constants the scheduler/worker/archive modules consult. Distinct
//! from `dirconfig`, which parses the DIR_CONFIG tree (a domain-specific
//! format with no natural serde mapping — see `dirconfig`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout;
use crate::util::StorageObject;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub work_dir: PathBuf,
    pub ssh_client_app_path: PathBuf,
    /// Consecutive transient-transport errors before a host is toggled (§4.C).
    pub max_errors: u32,
    /// Seconds a burstable worker idles awaiting its next job (§4.C).
    pub keep_connected_secs: u64,
    /// Seconds the scheduler waits for a burst ACK before declaring the
    /// chain failed and re-queuing the job (§4.C).
    pub wait_for_fd_reply_secs: u64,
    /// Seconds between SIGTERM and SIGKILL during a worker stop (§4.C, §5).
    pub abort_timeout_secs: u64,
    /// Housekeeping tick cadence: TRL recompute, archive signal, stale-lock
    /// reap, `etc/disabled_dirs` mtime poll (§4.C, §6).
    pub housekeeping_interval_secs: u64,
    /// Archive bucket quantization step, `ARCHIVE_STEP_TIME` (§4.G, §8 S3).
    pub archive_step_secs: u64,
    /// How often the archive scanner walks the tree (§4.G).
    pub archive_scan_interval_secs: u64,
    /// TTL for a dup-check digest before it's treated as unseen again (§4.H).
    pub dup_check_ttl_secs: u64,
    pub version: Option<u32>,
    #[serde(skip)]
    pub mode: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: PathBuf::new(),
            ssh_client_app_path: PathBuf::from("ssh"),
            max_errors: 3,
            keep_connected_secs: 10,
            wait_for_fd_reply_secs: 10,
            abort_timeout_secs: 30,
            housekeeping_interval_secs: 5,
            archive_step_secs: 86_400,
            archive_scan_interval_secs: 3_600,
            dup_check_ttl_secs: 86_400,
            version: Some(1),
            mode: 0,
        }
    }
}

impl Config {
    /// Mirrors `Config::init` in spirit: locate (or create) the config
    /// storage directory, load `config.json` if present, otherwise persist
    /// defaults. `mode == 1` selects `config_test.json`, the same test-mode
    /// convention the CLI ancestor used.
    pub fn init(mode: u8) -> anyhow::Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot find user's home directory"))?;
        let config_dir = layout::ensure_afd_config_dir(&home_dir)?;
        let config_path = if mode == 1 {
            let test_path = config_dir.join("config_test.json");
            if test_path.exists() { test_path } else { config_dir.join("config.json") }
        } else {
            config_dir.join("config.json")
        };

        let mut cfg: Config = if config_path.exists() {
            Config::read_from(&config_path)
        } else {
            let mut default_cfg = Config::default();
            default_cfg.work_dir = home_dir.join(".afd").join("work");
            default_cfg.save_to(&config_path);
            default_cfg
        };
        cfg.mode = mode;
        if cfg.work_dir.as_os_str().is_empty() {
            cfg.work_dir = home_dir.join(".afd").join("work");
        }
        Ok(cfg)
    }

    pub fn save_to_storage(&self) -> anyhow::Result<()> {
        let home_dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot find user's home directory"))?;
        let config_dir = layout::ensure_afd_config_dir(&home_dir)?;
        let config_path = if self.mode == 1 { config_dir.join("config_test.json") } else { config_dir.join("config.json") };
        self.save_to(&config_path);
        Ok(())
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs)
    }

    pub fn keep_connected(&self) -> Duration {
        Duration::from_secs(self.keep_connected_secs)
    }

    pub fn wait_for_fd_reply(&self) -> Duration {
        Duration::from_secs(self.wait_for_fd_reply_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings_match_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_errors, 3);
        assert_eq!(cfg.archive_step_secs, 86_400);
    }
}

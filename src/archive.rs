//! Archive scanner (§4.G): a dedicated thread that walks
//! `archive/[fs-id/]<hostalias>/<user|'none'>/<dir-number-hex>/<epoch-hex>_<job-hex>/`
//! (§6 "Directory layout on disk") and deletes any bucket whose epoch has
//! passed. A bucket's epoch is computed once, at archive time, from the
//! file's creation time and the owning directory's retention window
//! (§3 invariant 4: `epoch = floor((creation_time + retention_secs) / step) * step`),
//! so a sweep only has to parse a directory name rather than stat every
//! archived file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select, tick};
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::error::TransferError;
use crate::state::StateArea;
use crate::state::fra::DirRecord;

/// Step between archive epoch quantization points (`ARCHIVE_STEP_TIME` in
/// spec.md §9/S3). One day, matching the scenario's literal input.
pub const ARCHIVE_STEP_SECS: u64 = 86_400;

/// Upper bound on `<dir-number>` allocation attempts (§4.D "handling
/// `EMLINK` by allocating a new `<dir-number>`"); a backstop against an
/// infinite retry loop, not expected to be hit on any real filesystem.
const MAX_DIR_NUMBER: u32 = 65_536;

#[derive(Debug, Clone)]
pub enum ArchiveControl {
    Stop,
    RetryNow,
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// `floor((creation_time + retention_secs) / step) * step` (§3 invariant 4).
pub fn bucket_epoch(creation_time: u64, retention_secs: u64, step: u64) -> u64 {
    let deadline = creation_time + retention_secs;
    (deadline / step) * step
}

fn parse_bucket_name(name: &str) -> Option<(u64, u32)> {
    let (epoch_hex, job_hex) = name.split_once('_')?;
    let epoch = u64::from_str_radix(epoch_hex, 16).ok()?;
    let job = u32::from_str_radix(job_hex, 16).ok()?;
    Some((epoch, job))
}

fn is_emlink(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EMLINK)
}

/// Move a just-sent local file into its directory's archive bucket (§4.D
/// on success). `user` is the recipient URL's user component, or `None`
/// for the `'none'` placeholder. Falls back to copy+remove when `rename`
/// fails across a filesystem boundary; retries under the next
/// `<dir-number>` on `EMLINK` (§4.D, §4.G).
pub fn archive_file(
    root: &Path,
    host_alias: &str,
    user: Option<&str>,
    job_id: u32,
    creation_time: u64,
    retention_secs: u64,
    source: &Path,
) -> Result<(), TransferError> {
    let epoch = bucket_epoch(creation_time, retention_secs, ARCHIVE_STEP_SECS);
    let user_component = user.filter(|u| !u.is_empty()).unwrap_or("none");
    let file_name = source.file_name().ok_or_else(|| TransferError::ProtocolBug("archived path has no file name".to_string()))?;

    let user_dir = root.join(host_alias).join(user_component);
    let mut dir_number = 0u32;
    loop {
        if dir_number >= MAX_DIR_NUMBER {
            return Err(TransferError::LocalIo("archive: exhausted dir-number range".to_string()));
        }
        let bucket_dir = user_dir.join(format!("{dir_number:x}")).join(format!("{epoch:x}_{job_id:x}"));
        fs::create_dir_all(&bucket_dir).map_err(|e| TransferError::LocalIo(e.to_string()))?;
        let dest = bucket_dir.join(file_name);
        match fs::rename(source, &dest) {
            Ok(()) => return Ok(()),
            Err(e) if is_emlink(&e) => {
                dir_number += 1;
                continue;
            }
            Err(_) => {
                // Cross-filesystem or other non-link-count failure: copy+remove
                // under the same bucket, no dir-number retry needed.
                return fs::copy(source, &dest).map_err(|e| TransferError::LocalIo(e.to_string())).and_then(|_| {
                    fs::remove_file(source).map_err(|e| TransferError::LocalIo(e.to_string()))
                });
            }
        }
    }
}

/// Walk up from `start` removing now-empty directories, stopping at `root`
/// (exclusive) or the first non-empty ancestor (§4.G "removes empty parent
/// chains").
fn remove_empty_chain(start: &Path, root: &Path) {
    let mut current = start.to_path_buf();
    while current != root && current.starts_with(root) {
        match fs::read_dir(&current) {
            Ok(mut entries) if entries.next().is_none() => {}
            _ => break,
        }
        if fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

pub struct ArchiveScanner {
    root: PathBuf,
    #[allow(dead_code)]
    fra: Arc<Mutex<StateArea<DirRecord>>>,
    scan_interval: Duration,
    cmd_rx: Receiver<ArchiveControl>,
}

impl ArchiveScanner {
    pub fn new(root: PathBuf, fra: Arc<Mutex<StateArea<DirRecord>>>, scan_interval: Duration, cmd_rx: Receiver<ArchiveControl>) -> Self {
        ArchiveScanner { root, fra, scan_interval, cmd_rx }
    }

    /// Runs until `ArchiveControl::Stop` or the command channel closes.
    /// `RetryNow` (sent by `afdctl archive --force`, say) runs a sweep
    /// immediately instead of waiting for the next tick.
    pub fn run(&self) {
        let ticker = tick(self.scan_interval);
        let mut hour_marker = Instant::now();
        let mut removed_since_report: u64 = 0;
        loop {
            select! {
                recv(self.cmd_rx) -> msg => {
                    match msg {
                        Ok(ArchiveControl::Stop) | Err(_) => return,
                        Ok(ArchiveControl::RetryNow) => removed_since_report += self.sweep(),
                    }
                }
                recv(ticker) -> _ => {
                    removed_since_report += self.sweep();
                    if hour_marker.elapsed() >= Duration::from_secs(3600) {
                        tracing::info!(buckets_removed = removed_since_report, "archive sweep hourly report");
                        hour_marker = Instant::now();
                        removed_since_report = 0;
                    }
                }
            }
        }
    }

    /// One full pass over the archive tree: every `depth == 4` directory is
    /// a bucket (`<hostalias>/<user>/<dir-number>/<epoch>_<job>`);
    /// `follow_links(false)` plus the root symlink check mean a symlink
    /// anywhere in or at the root of the archive tree is never traversed,
    /// let alone deleted through (§4.G). A bucket's deadline is
    /// `epoch + step`; it's removed once `now` has passed that, independent
    /// of the live FRA retention setting, since the epoch already baked in
    /// the retention window at archive time (see S3).
    pub fn sweep(&self) -> u64 {
        if fs::symlink_metadata(&self.root).map(|m| m.file_type().is_symlink()).unwrap_or(true) {
            return 0;
        }
        let now = now_secs();
        let mut removed = 0;
        let mut touched_dirs: HashSet<PathBuf> = HashSet::new();

        let walker = WalkDir::new(&self.root).min_depth(4).max_depth(4).follow_links(false);
        for entry in walker.into_iter().flatten() {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some((epoch, _job_id)) = parse_bucket_name(&entry.file_name().to_string_lossy()) else { continue };
            if now < epoch + ARCHIVE_STEP_SECS {
                continue;
            }
            let parent_dir = entry.path().parent().map(Path::to_path_buf);
            if fs::remove_dir_all(entry.path()).is_ok() {
                removed += 1;
                if let Some(parent_dir) = parent_dir {
                    touched_dirs.insert(parent_dir);
                }
            }
        }
        for dir in touched_dirs {
            remove_empty_chain(&dir, &self.root);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_file_creates_epoch_job_bucket_and_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive_root = dir.path().join("archive");
        let source = dir.path().join("a.dat");
        std::fs::write(&source, b"payload").unwrap();
        archive_file(&archive_root, "host1", Some("alice"), 0x2a, 1000, 3600, &source).unwrap();
        assert!(!source.exists());

        let expected_epoch = bucket_epoch(1000, 3600, ARCHIVE_STEP_SECS);
        let bucket = archive_root.join("host1").join("alice").join("0").join(format!("{expected_epoch:x}_2a"));
        assert!(bucket.join("a.dat").exists(), "expected {bucket:?} to contain the archived file");
    }

    #[test]
    fn archive_file_defaults_user_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let archive_root = dir.path().join("archive");
        let source = dir.path().join("b.dat");
        std::fs::write(&source, b"payload").unwrap();
        archive_file(&archive_root, "host1", None, 1, 0, 0, &source).unwrap();
        assert!(archive_root.join("host1").join("none").exists());
    }

    /// S3: creation_time=1000, archive_time=3600, ARCHIVE_STEP_TIME=86400
    /// -> bucket epoch 0; scanner at now=90000 removes it, at now=4000 does not.
    #[test]
    fn sweep_follows_s3_retention_scenario() {
        assert_eq!(bucket_epoch(1000, 3600, 86_400), 0);

        let dir = tempfile::tempdir().unwrap();
        let archive_root = dir.path().join("archive");
        let bucket_dir = archive_root.join("host1").join("none").join("0").join("0_2a");
        std::fs::create_dir_all(&bucket_dir).unwrap();
        std::fs::write(bucket_dir.join("old.dat"), b"x").unwrap();

        let fra_path = dir.path().join("fra.dat");
        StateArea::<DirRecord>::create(&fra_path, &[DirRecord::new("incoming-a", "sftp://h/x", "/x")]).unwrap();
        let fra = Arc::new(Mutex::new(StateArea::<DirRecord>::attach(&fra_path).unwrap()));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let scanner = ArchiveScanner::new(archive_root.clone(), fra, Duration::from_secs(3600), rx);

        assert!(!is_expired(0, 4_000));
        assert!(is_expired(0, 90_000));

        // sweep() uses real wall-clock "now", which is always far past
        // epoch 0 plus one day, so this always lands in the expired branch.
        let removed = scanner.sweep();
        assert_eq!(removed, 1);
        assert!(!archive_root.join("host1").join("none").exists());
    }

    fn is_expired(epoch: u64, now: u64) -> bool {
        now >= epoch + ARCHIVE_STEP_SECS
    }
}

//! Transfer worker (§4.D): the per-file state machine a dispatched thread
//! drives against one host's adapter. Mirrors the teacher's
//! `run_upload_workers`/`run_download_workers` file loop shape — a `while`
//! loop over a `crossbeam_channel::Receiver`, reporting progress and a
//! single terminal `FinRecord` back to the scheduler — generalized from one
//! hard-coded transfer direction to the full
//! `START -> CONNECT -> LOGIN -> SELECT_DIR -> (RETRIEVE | SEND) ->
//! END_OF_BATCH -> (BURST_WAIT -> SELECT_DIR) | QUIT` cycle, with
//! `REPORT_ERROR` reachable from any state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;

use crate::dup_check::{CrcVariant, DigestScope, DupCheckStore, Outcome, digest};
use crate::error::TransferError;
use crate::protocol::{self, ProtocolAdapter};
use crate::rate_limit::{RateLimiterRegistry, parse_rate_bytes_per_sec};
use crate::retrieve_list::{RetrieveList, StupidMode};
use crate::scheduler::queue::QueuedJob;
use crate::scheduler::{AckRecord, DispatchJob, Dispatcher, ExitKind, FinRecord, ProgressUpdate, ReadyRecord};
use crate::state::StateArea;
use crate::state::fmd::FileMaskEntry;
use crate::state::fra::DirRecord;
use crate::state::jid::LockDiscipline;
use crate::state::pwb::CredentialStore;

/// Everything a worker thread needs that isn't specific to one job: the
/// shared directory/file-mask tables (read access only — the config loader
/// is the sole writer, worker-side mutation is limited to FRA progress
/// counters), credential lookup, dup-check store, and the per-directory
/// retrieve-list registry.
pub struct WorkerContext {
    pub fra: Arc<Mutex<StateArea<DirRecord>>>,
    pub fmd: Arc<StateArea<FileMaskEntry>>,
    pub credentials: Arc<CredentialStore>,
    pub dup_check: Arc<DupCheckStore>,
    pub retrieve_lists: Arc<Mutex<std::collections::HashMap<u32, Arc<RetrieveList>>>>,
    pub ls_data_dir: PathBuf,
    pub archive_root: PathBuf,
    pub keep_connected: Duration,
    pub dup_check_ttl_secs: i64,
    pub rate_limiters: Arc<RateLimiterRegistry>,
}

impl WorkerContext {
    fn retrieve_list_for(&self, dir_id: u32, dir_alias: &str, mode: StupidMode) -> Arc<RetrieveList> {
        let mut lists = self.retrieve_lists.lock();
        lists.entry(dir_id).or_insert_with(|| Arc::new(RetrieveList::open(&self.ls_data_dir.join(format!("{dir_alias}.json")), mode))).clone()
    }
}

/// Wires the scheduler's admission pass to real OS threads. `dispatch` is
/// called from the scheduler thread and must return immediately; the actual
/// work happens on the spawned thread.
pub struct WorkerDispatcher {
    ctx: Arc<WorkerContext>,
}

impl WorkerDispatcher {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        WorkerDispatcher { ctx }
    }
}

impl Dispatcher for WorkerDispatcher {
    fn dispatch(&self, job: DispatchJob) {
        let ctx = self.ctx.clone();
        std::thread::spawn(move || run(ctx, job));
    }
}

/// Translate a plain filename to the on-the-wire name used during transfer
/// and the name it should end up as once the transfer has completed, per
/// the remote-side lock discipline named in the job's JID tuple (§4.D).
/// Pure so it can be unit-tested without a live adapter.
pub fn lock_names(original: &str, discipline: LockDiscipline) -> (String, String) {
    match discipline {
        LockDiscipline::None => (original.to_string(), original.to_string()),
        LockDiscipline::DotPrefixThenRename => (format!(".{original}"), original.to_string()),
        LockDiscipline::DotPrefixVms => (format!(".{original}"), format!("{original};1")),
        LockDiscipline::Postfix => (format!("{original}.part"), original.to_string()),
        LockDiscipline::SideLockfile => (original.to_string(), original.to_string()),
    }
}

/// Whether `name` matches any of the DIR_CONFIG filter glob patterns.
/// Supports only the subset DIR_CONFIG actually emits: a literal string, or
/// one with `*` wildcards (no `?`/character classes), which is all the
/// grammar in `dirconfig` produces.
pub fn matches_any_filter(name: &str, patterns: &[String]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| glob_match(p, name))
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            if !rest.ends_with(part) {
                return false;
            }
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

struct Session {
    ctx: Arc<WorkerContext>,
    worker_id: crate::scheduler::WorkerId,
    host_alias: String,
    fin_tx: Sender<FinRecord>,
    ack_tx: Sender<AckRecord>,
    ready_tx: Sender<ReadyRecord>,
    progress_tx: Sender<ProgressUpdate>,
    should_stop: Arc<std::sync::atomic::AtomicBool>,
    bytes_total: u64,
    files_total: u32,
}

/// Drives one worker thread for its whole lifetime: the initially dispatched
/// job, then any further jobs handed over the burst channel, until a
/// `Stop` command arrives or the burst-keep-alive window lapses with nothing
/// new queued.
fn run(ctx: Arc<WorkerContext>, dispatch: DispatchJob) {
    let mut session = Session {
        ctx,
        worker_id: dispatch.worker_id,
        host_alias: dispatch.job.host_alias.clone(),
        fin_tx: dispatch.fin_tx,
        ack_tx: dispatch.ack_tx,
        ready_tx: dispatch.ready_tx,
        progress_tx: dispatch.progress_tx,
        should_stop: dispatch.should_stop,
        bytes_total: 0,
        files_total: 0,
    };

    let mut current = dispatch.job;
    let mut adapter: Option<Box<dyn ProtocolAdapter>> = None;

    loop {
        let exit_kind = session.process_job(&mut adapter, &current);
        if exit_kind != ExitKind::Success || session.should_stop.load(Ordering::Relaxed) {
            if let Some(mut a) = adapter.take() {
                a.quit();
            }
            session.finish(exit_kind);
            return;
        }

        match session.await_burst(&dispatch.cmd_rx) {
            Some(next) => current = next,
            None => {
                if let Some(mut a) = adapter.take() {
                    a.quit();
                }
                session.finish(ExitKind::Success);
                return;
            }
        }
    }
}

impl Session {
    /// CONNECT -> LOGIN -> SELECT_DIR -> RETRIEVE -> SEND for one job.
    /// Reuses `adapter` across burst jobs for the same host instead of
    /// reconnecting (§4.C burst policy).
    fn process_job(&mut self, adapter: &mut Option<Box<dyn ProtocolAdapter>>, job: &QueuedJob) -> ExitKind {
        let target = match protocol::parse_target(&job.job.recipient_url) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(job_id = job.job.job_id, error = %e, "unresolvable recipient url");
                return ExitKind::ProtocolBug;
            }
        };

        if adapter.is_none() {
            let cred = self.ctx.credentials.get(target.user.as_deref().unwrap_or(""), &target.host, target.scheme).ok().flatten();
            let credential = cred.map(|password| crate::state::pwb::Credential { user: target.user.clone().unwrap_or_default(), host: target.host.clone(), protocol: target.scheme.to_string(), password });
            let mut a = protocol::adapter_for(target.scheme);
            if let Err(e) = a.connect(&target, credential.as_ref()) {
                tracing::warn!(job_id = job.job.job_id, host = %self.host_alias, error = %e, "connect failed");
                return classify_protocol_error(&e);
            }
            *adapter = Some(a);
        }
        let a = adapter.as_mut().expect("adapter set above");

        let (fs_path, dir_alias, dir_url, stupid_mode) = match self.dir_info(job.job.dir_id) {
            Some(v) => v,
            None => return ExitKind::StateCorrupt,
        };
        let patterns = self.ctx.fmd.lookup_by_id(job.job.file_mask_id).and_then(|pos| self.ctx.fmd.get(pos)).map(|e| e.patterns).unwrap_or_default();

        if !dir_url.is_empty() {
            self.retrieve(a.as_mut(), &dir_url, &fs_path, job.job.dir_id, &dir_alias, stupid_mode, &patterns, &job.job.socket_options);
            if self.should_stop.load(Ordering::Relaxed) {
                return ExitKind::Success;
            }
        }

        self.send(a.as_mut(), &fs_path, &dir_alias, &patterns, job)
    }

    fn dir_info(&self, dir_id: u32) -> Option<(String, String, String, StupidMode)> {
        let fra = self.ctx.fra.lock();
        let pos = fra.lookup_by_id(dir_id)?;
        let rec = fra.get(pos)?;
        Some((rec.fs_path, rec.alias, rec.url, rec.stupid_mode))
    }

    /// RETRIEVE state (§4.D): pull any not-yet-seen remote entries from
    /// `dir_url` down into `fs_path`, consulting the directory's
    /// retrieve-list for `stupid_mode` de-duplication (§4.F).
    fn retrieve(&mut self, adapter: &mut dyn ProtocolAdapter, dir_url: &str, fs_path: &str, dir_id: u32, dir_alias: &str, stupid_mode: StupidMode, patterns: &[String], socket_options: &str) {
        let entries = match adapter.list(dir_url) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(dir = dir_alias, error = %e, "retrieve list failed, skipping this pass");
                return;
            }
        };
        let rate_limit = parse_rate_bytes_per_sec(socket_options);
        let list = self.ctx.retrieve_list_for(dir_id, dir_alias, stupid_mode);
        for entry in entries.into_iter().filter(|e| !e.is_dir && matches_any_filter(&e.name, patterns)) {
            if self.should_stop.load(Ordering::Relaxed) {
                return;
            }
            if !list.should_retrieve(&entry.name, entry.size, entry.mtime) {
                continue;
            }
            let local_path = Path::new(fs_path).join(&entry.name);
            let remote_path = format!("{}/{}", dir_url.trim_end_matches('/'), entry.name);
            self.ctx.rate_limiters.throttle(&self.host_alias, rate_limit, entry.size);
            match adapter.get(&remote_path, &local_path) {
                Ok(bytes) => {
                    list.mark_stored(&entry.name, entry.size, entry.mtime);
                    self.bytes_total += bytes;
                    self.files_total += 1;
                    self.report_progress(0, 1);
                }
                Err(e) => {
                    tracing::warn!(dir = dir_alias, name = %entry.name, error = %e, "retrieve failed");
                    list.abandon(&entry.name);
                }
            }
        }
    }

    /// SEND state (§4.D): push every locally matching file out to the
    /// job's recipient, applying lock discipline, dup-check, and archiving
    /// on success.
    fn send(&mut self, adapter: &mut dyn ProtocolAdapter, fs_path: &str, dir_alias: &str, patterns: &[String], job: &QueuedJob) -> ExitKind {
        let dir = match std::fs::read_dir(fs_path) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(fs_path, error = %e, "cannot read local directory");
                return ExitKind::LocalIo;
            }
        };

        for entry in dir.flatten() {
            if self.should_stop.load(Ordering::Relaxed) {
                return ExitKind::Success;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matches_any_filter(&name, patterns) {
                continue;
            }

            let d = digest(CrcVariant::Crc32, DigestScope::NameAndSize, &name, meta.len(), None);
            let outcome = self.ctx.dup_check.check(job.job.dir_id, CrcVariant::Crc32, d, now(), self.ctx.dup_check_ttl_secs, Outcome::StoreAndSkip);
            match outcome {
                Ok(Outcome::StoreAndSkip) => continue,
                Ok(Outcome::Delete) => {
                    let _ = std::fs::remove_file(entry.path());
                    continue;
                }
                Ok(Outcome::WarnAndSend) => {}
                Err(e) => {
                    tracing::warn!(name, error = %e, "dup-check lookup failed");
                    return ExitKind::StateCorrupt;
                }
            }

            let (upload_name, final_name) = lock_names(&name, job.job.lock_discipline);
            let remote_path = format!("{}/{}", job.job.recipient_url.trim_end_matches('/'), upload_name);
            let rate_limit = parse_rate_bytes_per_sec(&job.job.socket_options);
            self.ctx.rate_limiters.throttle(&self.host_alias, rate_limit, meta.len());
            match self.put_with_retry(adapter, &entry.path(), &remote_path) {
                Ok(bytes) => {
                    if upload_name != final_name {
                        let final_path = format!("{}/{}", job.job.recipient_url.trim_end_matches('/'), final_name);
                        if let Err(e) = adapter.rename_remote(&remote_path, &final_path) {
                            tracing::warn!(name, error = %e, "post-transfer rename failed");
                            return classify_protocol_error(&e);
                        }
                    }
                    self.bytes_total += bytes;
                    self.files_total += 1;
                    self.record_dir_progress(job.job.dir_id, bytes);
                    self.archive_local_copy(&entry.path(), job);
                    self.report_progress(bytes, 1);
                }
                Err(e) => {
                    tracing::warn!(name, error = %e, "send failed");
                    return classify_protocol_error(&e);
                }
            }
        }
        ExitKind::Success
    }

    fn put_with_retry(&self, adapter: &mut dyn ProtocolAdapter, local: &Path, remote: &str) -> Result<u64, crate::error::ProtocolError> {
        crate::util::retry_operation(3, Duration::from_millis(200), |_attempt| adapter.put(local, remote))
    }

    fn record_dir_progress(&self, dir_id: u32, bytes: u64) {
        let mut fra = self.ctx.fra.lock();
        if let Some(pos) = fra.lookup_by_id(dir_id) {
            let _ = fra.update(pos, |rec| {
                rec.files_done += 1;
                rec.bytes_done += bytes;
            });
        }
    }

    /// Move the just-sent file into the archive tree on success (§4.D/§4.G),
    /// unless the owning directory has archiving disabled
    /// (`archive_time_secs == 0`, §3 "Directory record"). A failure here is
    /// logged, not fatal to the job — the file was already delivered.
    fn archive_local_copy(&self, path: &Path, job: &QueuedJob) {
        let retention_secs = {
            let fra = self.ctx.fra.lock();
            fra.lookup_by_id(job.job.dir_id).and_then(|pos| fra.get(pos)).map(|r| r.archive_time_secs).unwrap_or(0)
        };
        if retention_secs == 0 {
            return;
        }
        let user = protocol::parse_target(&job.job.recipient_url).ok().and_then(|t| t.user);
        if let Err(e) = crate::archive::archive_file(&self.ctx.archive_root, &self.host_alias, user.as_deref(), job.job.job_id, now() as u64, retention_secs, path) {
            tracing::warn!(path = %path.display(), error = %e, "archiving sent file failed");
        }
    }

    fn report_progress(&self, bytes: u64, files: u32) {
        let _ = self.progress_tx.send(ProgressUpdate { worker_id: self.worker_id, host_alias: self.host_alias.clone(), slot: 0, protocol_phase: 0, bytes_done: bytes, file_count: files, job_id: 0 });
    }

    /// END_OF_BATCH -> BURST_WAIT -> SELECT_DIR (or QUIT): announces
    /// entry into BURST_WAIT so the scheduler knows this worker is now
    /// eligible for same-host reuse, then idles on the worker's own command
    /// channel for up to `keep_connected` waiting for a handoff. Acks each
    /// accepted handoff separately, once the new job is actually in hand —
    /// the ready signal is what makes a worker burstable in the first
    /// place, not the ack (see `scheduler::Scheduler::handle_ready`).
    fn await_burst(&self, cmd_rx: &crossbeam_channel::Receiver<crate::scheduler::WorkerCmd>) -> Option<QueuedJob> {
        let _ = self.ready_tx.send(ReadyRecord { worker_id: self.worker_id, host_alias: self.host_alias.clone() });
        let deadline = Instant::now() + self.ctx.keep_connected;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            select! {
                recv(cmd_rx) -> msg => {
                    match msg {
                        Ok(crate::scheduler::WorkerCmd::NewJob(job)) => {
                            let _ = self.ack_tx.send(AckRecord { worker_id: self.worker_id, timestamp: now(), job_id: job.job.job_id, split_counter: 0, unique_id: job.msg_number });
                            return Some(job);
                        }
                        Ok(crate::scheduler::WorkerCmd::Stop) | Err(_) => return None,
                    }
                }
                default(remaining) => return None,
            }
        }
    }

    fn finish(&self, exit_kind: ExitKind) {
        let _ = self.fin_tx.send(FinRecord { worker_id: self.worker_id, host_alias: self.host_alias.clone(), exit_kind, bytes: self.bytes_total, files: self.files_total });
    }
}

fn classify_protocol_error(e: &crate::error::ProtocolError) -> ExitKind {
    use crate::error::ProtocolError::*;
    match e {
        Transfer(t) => classify_transfer_error(t),
        Ssh(_) => ExitKind::Transient,
        Tls(_) | UnknownScheme(_) | NotImplemented { .. } => ExitKind::ProtocolBug,
        Io(_) => ExitKind::LocalIo,
    }
}

fn classify_transfer_error(e: &TransferError) -> ExitKind {
    use TransferError::*;
    match e {
        ConnectRefused(_) | ConnectTimeout(_) | ConnectReset(_) | FileBusy(_) | CloseRemoteFailed(_) | SizeMismatch { .. } => ExitKind::Transient,
        AuthFailed(_) | HostKeyMismatch(_) => ExitKind::Auth,
        ListFailed(_) | OpenRemoteFailed(_) | WriteRemoteFailed(_) => ExitKind::RemoteSemantic,
        LocalIo(_) | DiskFull => ExitKind::LocalIo,
        ArchiveFull | StateAreaCorrupt(_) => ExitKind::StateCorrupt,
        UnknownPrompt(_) | ProtocolBug(_) => ExitKind::ProtocolBug,
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_prefix_then_rename_uses_hidden_upload_name() {
        let (upload, final_name) = lock_names("data.dat", LockDiscipline::DotPrefixThenRename);
        assert_eq!(upload, ".data.dat");
        assert_eq!(final_name, "data.dat");
    }

    #[test]
    fn postfix_uses_part_suffix_during_transfer() {
        let (upload, final_name) = lock_names("data.dat", LockDiscipline::Postfix);
        assert_eq!(upload, "data.dat.part");
        assert_eq!(final_name, "data.dat");
    }

    #[test]
    fn none_discipline_uses_the_same_name_throughout() {
        let (upload, final_name) = lock_names("data.dat", LockDiscipline::None);
        assert_eq!(upload, final_name);
    }

    #[test]
    fn glob_matches_prefix_and_suffix_wildcards() {
        assert!(matches_any_filter("data.dat", &["*.dat".to_string()]));
        assert!(matches_any_filter("report_2024.csv", &["report_*".to_string()]));
        assert!(!matches_any_filter("data.dat", &["*.grib2".to_string()]));
    }

    #[test]
    fn empty_filter_list_matches_everything() {
        assert!(matches_any_filter("anything.bin", &[]));
    }

    #[test]
    fn socket_options_rate_token_is_parsed_for_throttling() {
        assert_eq!(parse_rate_bytes_per_sec("tcp_nodelay,rate=32768"), Some(32768));
        assert_eq!(parse_rate_bytes_per_sec("tcp_nodelay"), None);
    }
}

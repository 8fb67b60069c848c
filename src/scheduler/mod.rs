//! Scheduler / transfer dispatcher (FD role, §4.C): owns the per-host and
//! per-directory runtime tables, the priority job queue, and the FSA's one
//! writer. Worker *threads* (not child processes — see the architecture
//! note in SPEC_FULL.md §2) report progress and completion over channels;
//! the scheduler is the sole FSA writer, matching §5's "many readers, one
//! writer (scheduler) per field".

pub mod queue;

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use parking_lot::Mutex;

use crate::state::StateArea;
use crate::state::fra::DirRecord;
use crate::state::fsa::HostRecord;
use crate::state::jid::JobRecord;
use queue::{JobQueue, QueuedJob};

pub type HostId = String;
pub type WorkerId = u64;

#[derive(Debug, Clone)]
pub enum ControlMsg {
    /// `RESCAN` (scheduler cmd fifo, §6): force an immediate due-check over
    /// every already-known directory, ignoring `next_check_time`. Does not
    /// touch DIR_CONFIG itself — see `ReloadDirConfig` for that.
    Rescan,
    /// `RELOAD_DIR_CONFIG` (supervisor cmd fifo, §6): a freshly parsed
    /// DIR_CONFIG generation, already merged against live FSA/FRA counters
    /// by the caller. The scheduler is the sole writer of both areas, so
    /// publishing and reindexing happens here rather than in `supervisor`.
    ReloadDirConfig { hosts: Vec<HostRecord>, directories: Vec<DirRecord>, jobs: Vec<JobRecord>, job_hosts: Vec<HostId> },
    ToggleHost(HostId),
    PauseQueue,
    ResumeQueue,
    Shutdown,
    FreezeAdmissions,
    ResumeAdmissions(Vec<(HostId, JobRecord)>),
}

/// Sent to a live worker over its dedicated command channel, standing in
/// for `SIGTERM`/a burst job descriptor (§4.C, §5).
#[derive(Debug, Clone)]
pub enum WorkerCmd {
    NewJob(QueuedJob),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Transient,
    Auth,
    RemoteSemantic,
    LocalIo,
    StateCorrupt,
    ProtocolBug,
}

impl ExitKind {
    /// §7: only transient transport errors count toward the host-toggle
    /// threshold; everything else either never retries or retries without
    /// touching the error counter.
    fn counts_toward_host_toggle(self) -> bool {
        matches!(self, ExitKind::Transient)
    }
}

#[derive(Debug, Clone)]
pub struct FinRecord {
    pub worker_id: WorkerId,
    pub host_alias: String,
    pub exit_kind: ExitKind,
    pub bytes: u64,
    pub files: u32,
}

/// Burst continuation acknowledgement (§4.C): a worker emits this after
/// accepting a new job descriptor over its burst channel.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub worker_id: WorkerId,
    pub timestamp: i64,
    pub job_id: u32,
    pub split_counter: u32,
    pub unique_id: u64,
}

/// Emitted once a worker has finished its current job and entered
/// `BURST_WAIT`, i.e. it's idle on its command channel and available for
/// same-host reuse (§4.C). Distinct from `AckRecord`, which fires only
/// *after* a burst handoff has already happened — `try_admit_one` needs a
/// signal that fires *before* the first handoff too, or no worker ever
/// becomes burstable in the first place.
#[derive(Debug, Clone)]
pub struct ReadyRecord {
    pub worker_id: WorkerId,
    pub host_alias: HostId,
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub worker_id: WorkerId,
    pub host_alias: String,
    pub slot: usize,
    pub protocol_phase: u8,
    pub bytes_done: u64,
    pub file_count: u32,
    pub job_id: u32,
}

/// What the admission pass hands off to whatever actually runs a transfer.
/// Kept as a trait rather than a direct dependency on `worker` so the two
/// modules don't need to know about each other's internals; `supervisor`
/// wires a real `worker::spawn`-backed implementation at startup.
pub trait Dispatcher: Send {
    fn dispatch(&self, job: DispatchJob);
}

pub struct DispatchJob {
    pub worker_id: WorkerId,
    pub job: QueuedJob,
    pub cmd_rx: Receiver<WorkerCmd>,
    pub fin_tx: Sender<FinRecord>,
    pub ack_tx: Sender<AckRecord>,
    pub ready_tx: Sender<ReadyRecord>,
    pub progress_tx: Sender<ProgressUpdate>,
    pub should_stop: Arc<AtomicBool>,
}

struct HostRuntime {
    handle: crate::state::Handle<HostRecord>,
    allowed: u16,
    active: u16,
    consecutive_errors: u32,
    max_errors: u32,
    using_toggle: bool,
    last_toggle_probe: Option<Instant>,
    toggle_hostname: String,
    primary_hostname: String,
}

struct DirRuntime {
    handle: crate::state::Handle<DirRecord>,
}

struct LiveWorker {
    host_alias: HostId,
    cmd_tx: Sender<WorkerCmd>,
    should_stop: Arc<AtomicBool>,
    burst_deadline: Option<Instant>,
    stop_requested_at: Option<Instant>,
}

pub struct Scheduler {
    fsa: Arc<Mutex<StateArea<HostRecord>>>,
    fra: Arc<Mutex<StateArea<DirRecord>>>,
    hosts: HashMap<HostId, HostRuntime>,
    dirs: HashMap<u32, DirRuntime>,
    dir_jobs: HashMap<u32, Vec<(HostId, JobRecord)>>,
    queue: JobQueue,
    workers: HashMap<WorkerId, LiveWorker>,
    next_worker_id: AtomicU64,
    admissions_frozen: bool,
    max_errors_default: u32,

    dispatcher: Box<dyn Dispatcher>,
    cmd_rx: Receiver<ControlMsg>,
    fin_tx: Sender<FinRecord>,
    fin_rx: Receiver<FinRecord>,
    ack_tx: Sender<AckRecord>,
    ack_rx: Receiver<AckRecord>,
    ready_tx: Sender<ReadyRecord>,
    ready_rx: Receiver<ReadyRecord>,
    progress_tx: Sender<ProgressUpdate>,
    progress_rx: Receiver<ProgressUpdate>,

    keep_connected: Duration,
    abort_timeout: Duration,
    housekeeping_interval: Duration,
    toggle_probe_backoff: Duration,
}

impl Scheduler {
    pub fn new(
        fsa: Arc<Mutex<StateArea<HostRecord>>>,
        fra: Arc<Mutex<StateArea<DirRecord>>>,
        dispatcher: Box<dyn Dispatcher>,
        cmd_rx: Receiver<ControlMsg>,
        config: &crate::config::Config,
    ) -> Self {
        let (fin_tx, fin_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();
        let (progress_tx, progress_rx) = unbounded();
        Scheduler {
            fsa,
            fra,
            hosts: HashMap::new(),
            dirs: HashMap::new(),
            dir_jobs: HashMap::new(),
            queue: JobQueue::new(),
            workers: HashMap::new(),
            next_worker_id: AtomicU64::new(1),
            admissions_frozen: false,
            max_errors_default: config.max_errors,
            dispatcher,
            cmd_rx,
            fin_tx,
            fin_rx,
            ack_tx,
            ack_rx,
            ready_tx,
            ready_rx,
            progress_tx,
            progress_rx,
            keep_connected: config.keep_connected(),
            abort_timeout: config.abort_timeout(),
            housekeeping_interval: config.housekeeping_interval(),
            toggle_probe_backoff: Duration::from_secs(30),
        }
    }

    /// Load the host and directory runtime tables from the just-attached FSA
    /// and FRA, called once at startup and again after the config loader
    /// reindexes a fresh generation.
    pub fn reindex_hosts_and_dirs(&mut self) {
        self.hosts.clear();
        {
            let fsa = self.fsa.lock();
            for pos in 0..fsa.len() {
                let Some(rec) = fsa.get(pos) else { continue };
                let Some(handle) = fsa.handle_for_id(rec.id()) else { continue };
                self.hosts.insert(
                    rec.alias.clone(),
                    HostRuntime {
                        handle,
                        allowed: rec.allowed,
                        active: rec.active,
                        consecutive_errors: rec.consecutive_errors,
                        max_errors: self.max_errors_default,
                        using_toggle: rec.using_toggle,
                        last_toggle_probe: None,
                        toggle_hostname: rec.hostname_toggle.clone(),
                        primary_hostname: rec.hostname_active.clone(),
                    },
                );
            }
        }
        self.dirs.clear();
        {
            let fra = self.fra.lock();
            for pos in 0..fra.len() {
                let Some(rec) = fra.get(pos) else { continue };
                let Some(handle) = fra.handle_for_id(rec.id()) else { continue };
                self.dirs.insert(rec.dir_id, DirRuntime { handle });
            }
        }
    }

    /// Install the job templates the config loader produced, grouped by the
    /// directory that originates them: `housekeeping`'s due-directory scan
    /// (§4.C step 2) needs to know what file-set a directory expands to
    /// without re-parsing DIR_CONFIG on every tick.
    pub fn set_dir_jobs(&mut self, jobs: Vec<JobRecord>, job_hosts: Vec<HostId>) {
        self.dir_jobs.clear();
        for (job, host_alias) in jobs.into_iter().zip(job_hosts) {
            self.dir_jobs.entry(job.dir_id).or_default().push((host_alias, job));
        }
    }

    pub fn enqueue(&mut self, host_alias: impl Into<String>, job: JobRecord) -> u64 {
        self.queue.push_new(host_alias, job)
    }

    /// The main loop: a single thread selecting over FIN, ACK, progress,
    /// control, and a housekeeping tick, exactly the component shape of
    /// §4.C/§5. Returns once `Shutdown` is processed and all workers have
    /// been told to stop.
    pub fn run(&mut self) {
        let housekeeping = tick(self.housekeeping_interval);
        loop {
            select! {
                recv(self.fin_rx) -> msg => {
                    match msg {
                        Ok(fin) => self.handle_fin(fin),
                        Err(_) => break,
                    }
                }
                recv(self.ack_rx) -> msg => {
                    if let Ok(ack) = msg { self.handle_ack(ack); }
                }
                recv(self.ready_rx) -> msg => {
                    if let Ok(ready) = msg { self.handle_ready(ready); }
                }
                recv(self.progress_rx) -> msg => {
                    if let Ok(update) = msg { self.handle_progress(update); }
                }
                recv(self.cmd_rx) -> msg => {
                    match msg {
                        Ok(ControlMsg::Shutdown) => {
                            self.shutdown_all();
                            break;
                        }
                        Ok(other) => self.handle_control(other),
                        Err(_) => break,
                    }
                }
                recv(housekeeping) -> _ => self.housekeeping(),
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Rescan => self.scan_directories(true),
            ControlMsg::ReloadDirConfig { hosts, directories, jobs, job_hosts } => self.reload_dir_config(hosts, directories, jobs, job_hosts),
            ControlMsg::ToggleHost(alias) => self.toggle_host(&alias),
            ControlMsg::PauseQueue => self.queue.pause(),
            ControlMsg::ResumeQueue => self.queue.resume(),
            ControlMsg::FreezeAdmissions => self.admissions_frozen = true,
            ControlMsg::ResumeAdmissions(reindexed) => {
                self.admissions_frozen = false;
                for (host_alias, job) in reindexed {
                    self.enqueue(host_alias, job);
                }
            }
            ControlMsg::Shutdown => unreachable!("handled by caller before dispatch"),
        }
    }

    fn handle_fin(&mut self, fin: FinRecord) {
        self.workers.remove(&fin.worker_id);
        let Some(host) = self.hosts.get_mut(&fin.host_alias) else { return };
        host.active = host.active.saturating_sub(1);
        match fin.exit_kind {
            ExitKind::Success => {
                host.consecutive_errors = 0;
            }
            other if other.counts_toward_host_toggle() => {
                host.consecutive_errors += 1;
                if host.consecutive_errors >= host.max_errors && !host.toggle_hostname.is_empty() {
                    self.toggle_host(&fin.host_alias);
                }
            }
            _ => {}
        }
        self.sync_host_counters(&fin.host_alias);
        self.try_admit();
    }

    /// Purely informational by the time it arrives: the handoff that
    /// triggered this ack already cleared `burst_deadline` in
    /// `try_admit_one` (the job is already running). Setting it here too
    /// would just recreate the circular dependency `handle_ready` exists
    /// to break — see its doc comment.
    fn handle_ack(&mut self, ack: AckRecord) {
        tracing::debug!(worker_id = ack.worker_id, job_id = ack.job_id, split = ack.split_counter, "burst ack received");
    }

    /// A worker has finished its current job and is idling in `BURST_WAIT`,
    /// available for same-host reuse (§4.C). This is the only place a
    /// worker's *first* `burst_deadline` gets set: `handle_ack` can't do it,
    /// since an ack only ever follows a handoff that itself required
    /// `burst_deadline` to already be `Some` — without this signal no
    /// worker would ever become burstable and property 6/scenario S1 would
    /// never hold.
    fn handle_ready(&mut self, ready: ReadyRecord) {
        if let Some(worker) = self.workers.get_mut(&ready.worker_id) {
            worker.burst_deadline = Some(Instant::now() + self.keep_connected);
        }
        tracing::debug!(worker_id = ready.worker_id, host = %ready.host_alias, "worker entered burst wait");
        self.try_admit();
    }

    fn handle_progress(&mut self, update: ProgressUpdate) {
        let Some(host) = self.hosts.get(&update.host_alias) else { return };
        let mut fsa = self.fsa.lock();
        let Ok(pos) = fsa.resolve(&host.handle) else { return };
        let _ = fsa.update(pos, |rec| {
            if let Some(slot) = rec.job_slots.get_mut(update.slot) {
                slot.protocol_phase = update.protocol_phase;
                slot.bytes_done = update.bytes_done;
                slot.file_count = update.file_count;
                slot.job_id = update.job_id;
            }
        });
    }

    /// Host-toggle policy (§4.C, property 5): swap active/toggle hostnames
    /// and reset the error counter. Reverting to the primary is driven by
    /// `housekeeping`'s periodic reachability probe, not here.
    fn toggle_host(&mut self, alias: &str) {
        let Some(host) = self.hosts.get_mut(alias) else { return };
        host.using_toggle = !host.using_toggle;
        host.consecutive_errors = 0;
        host.last_toggle_probe = Some(Instant::now());
        let handle = host.handle;
        let using_toggle = host.using_toggle;
        let mut fsa = self.fsa.lock();
        if let Ok(pos) = fsa.resolve(&handle) {
            let _ = fsa.update(pos, |rec| {
                rec.using_toggle = using_toggle;
                rec.consecutive_errors = 0;
            });
        }
    }

    fn sync_host_counters(&mut self, alias: &str) {
        let Some(host) = self.hosts.get(alias) else { return };
        let handle = host.handle;
        let (active, errors) = (host.active, host.consecutive_errors);
        let mut fsa = self.fsa.lock();
        if let Ok(pos) = fsa.resolve(&handle) {
            let _ = fsa.update(pos, |rec| {
                rec.active = active;
                rec.consecutive_errors = errors;
            });
        }
    }

    /// `RELOAD_DIR_CONFIG`: the caller (`supervisor`) has already parsed
    /// DIR_CONFIG into a fresh, unmerged generation; merging against live
    /// counters and publishing both areas has to happen here since the
    /// scheduler is their only writer. Reindexes and re-derives `dir_jobs`
    /// from the new generation, then lets queued-but-now-stale jobs drain
    /// through the normal admission path.
    fn reload_dir_config(&mut self, hosts: Vec<HostRecord>, directories: Vec<DirRecord>, jobs: Vec<JobRecord>, job_hosts: Vec<HostId>) {
        let merged_hosts = {
            let fsa = self.fsa.lock();
            let existing: Vec<HostRecord> = (0..fsa.len()).filter_map(|p| fsa.get(p)).collect();
            crate::dirconfig::merge_hosts(&existing, hosts)
        };
        let merged_dirs = {
            let fra = self.fra.lock();
            let existing: Vec<DirRecord> = (0..fra.len()).filter_map(|p| fra.get(p)).collect();
            crate::dirconfig::merge_directories(&existing, directories)
        };
        if let Err(e) = self.fsa.lock().publish_new(&merged_hosts) {
            tracing::error!(error = %e, "failed to publish reloaded FSA generation");
            return;
        }
        if let Err(e) = self.fra.lock().publish_new(&merged_dirs) {
            tracing::error!(error = %e, "failed to publish reloaded FRA generation");
            return;
        }
        self.reindex_hosts_and_dirs();
        self.set_dir_jobs(jobs, job_hosts);
        tracing::info!(hosts = self.hosts.len(), dirs = self.dirs.len(), "DIR_CONFIG reloaded");
        self.try_admit();
    }

    /// Admission pass (§4.C step 3): for each eligible queued job, either
    /// hand it to an existing burstable worker for the same host or spawn a
    /// fresh one. Runs once per FIN and once per housekeeping tick.
    fn try_admit(&mut self) {
        if self.admissions_frozen || self.queue.is_paused() {
            return;
        }
        let mut deferred = Vec::new();
        while let Some(queued) = self.queue.pop() {
            let admitted = self.try_admit_one(&queued);
            if !admitted {
                deferred.push(queued);
            }
        }
        for job in deferred {
            self.queue.requeue(job);
        }
    }

    /// Returns `false` when the job can't be admitted right now (host at
    /// capacity and no burstable worker to hand it to); the caller is
    /// responsible for requeuing it. The burst-handoff search runs *before*
    /// the capacity check: an already-live, already-counted worker adds no
    /// new concurrent transfer, so reusing it must stay reachable even when
    /// `active == allowed` (S1's `max_parallel(H1)=1` case) — only spawning
    /// a *new* worker needs spare capacity.
    fn try_admit_one(&mut self, queued: &QueuedJob) -> bool {
        if !self.hosts.contains_key(&queued.host_alias) {
            return false;
        }

        if let Some((worker_id, worker)) = self.workers.iter().find(|(_, w)| w.host_alias == queued.host_alias && w.burst_deadline.is_some()) {
            let worker_id = *worker_id;
            if worker.cmd_tx.send(WorkerCmd::NewJob(queued.clone())).is_ok() {
                if let Some(w) = self.workers.get_mut(&worker_id) {
                    w.burst_deadline = None;
                }
                return true;
            }
        }

        let host = self.hosts.get(&queued.host_alias).expect("checked above");
        if host.active >= host.allowed {
            return false;
        }

        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let should_stop = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = unbounded();
        self.workers.insert(
            worker_id,
            LiveWorker { host_alias: queued.host_alias.clone(), cmd_tx, should_stop: should_stop.clone(), burst_deadline: None, stop_requested_at: None },
        );
        if let Some(host) = self.hosts.get_mut(&queued.host_alias) {
            host.active += 1;
        }
        self.dispatcher.dispatch(DispatchJob {
            worker_id,
            job: queued.clone(),
            cmd_rx,
            fin_tx: self.fin_tx.clone(),
            ack_tx: self.ack_tx.clone(),
            ready_tx: self.ready_tx.clone(),
            progress_tx: self.progress_tx.clone(),
            should_stop,
        });
        true
    }

    /// Periodic housekeeping (§4.C step 4, folding in step 2's due-directory
    /// scan): burst deadline expiry (treated as burst failure → requeue not
    /// needed, the job already completed), due-directory scan and enqueue,
    /// toggled-host reachability probe, abort-timeout enforcement on workers
    /// asked to stop.
    fn housekeeping(&mut self) {
        self.reap_expired_bursts();
        self.scan_directories(false);
        self.enforce_abort_timeouts();
        self.probe_toggled_hosts();
        self.try_admit();
    }

    /// §4.C step 2: "scan directories whose `next_scan_time ≤ now` and not
    /// stopped/disabled; enqueue produced file-sets." `force` (from
    /// `ControlMsg::Rescan`, the `RESCAN` verb) ignores `next_check_time`
    /// but still honors disabled/stopped. A directory with no known jobs
    /// (an empty `[recipient]` block, say) is skipped rather than treated
    /// as an error.
    fn scan_directories(&mut self, force: bool) {
        let now = chrono::Utc::now().timestamp();
        let dir_ids: Vec<u32> = self.dirs.keys().copied().collect();
        let next_check = now + self.housekeeping_interval.as_secs() as i64;
        for dir_id in dir_ids {
            let handle = self.dirs[&dir_id].handle;
            let mut fra = self.fra.lock();
            let Ok(pos) = fra.resolve(&handle) else { continue };
            let Some(rec) = fra.get(pos) else { continue };
            let due = force && !rec.is_disabled() && rec.flags & crate::state::fra::dir_flags::STOPPED == 0 || rec.is_due(now);
            if !due {
                continue;
            }
            let _ = fra.update(pos, |r| r.next_check_time = next_check);
            drop(fra);
            if let Some(jobs) = self.dir_jobs.get(&dir_id).cloned() {
                for (host_alias, job) in jobs {
                    self.enqueue(host_alias, job);
                }
            }
        }
    }

    fn reap_expired_bursts(&mut self) {
        let now = Instant::now();
        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter_map(|(id, w)| w.burst_deadline.filter(|d| *d <= now).map(|_| *id))
            .collect();
        for id in expired {
            if let Some(worker) = self.workers.remove(&id) {
                let _ = worker.cmd_tx.send(WorkerCmd::Stop);
                worker.should_stop.store(true, Ordering::Relaxed);
                if let Some(host) = self.hosts.get_mut(&worker.host_alias) {
                    host.active = host.active.saturating_sub(1);
                }
            }
        }
    }

    fn enforce_abort_timeouts(&mut self) {
        let now = Instant::now();
        let abort_timeout = self.abort_timeout;
        for worker in self.workers.values_mut() {
            if let Some(requested_at) = worker.stop_requested_at
                && now.duration_since(requested_at) >= abort_timeout
            {
                worker.should_stop.store(true, Ordering::Relaxed);
            }
        }
    }

    fn probe_toggled_hosts(&mut self) {
        let now = Instant::now();
        let backoff = self.toggle_probe_backoff;
        let candidates: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, h)| h.using_toggle && h.last_toggle_probe.map(|t| now.duration_since(t) >= backoff).unwrap_or(true))
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in candidates {
            let Some(host) = self.hosts.get_mut(&alias) else { continue };
            host.last_toggle_probe = Some(now);
            if probe_reachable(&host.primary_hostname) {
                self.toggle_host(&alias);
            }
        }
    }

    /// `stop(host)` (§5): drain undispatched jobs, signal active workers to
    /// finish-current-file-then-exit, and let the abort-timeout machinery
    /// escalate to a forced stop.
    pub fn stop_host(&mut self, alias: &str) -> Vec<QueuedJob> {
        let drained = self.queue.drain_for_host(alias);
        let now = Instant::now();
        for worker in self.workers.values_mut().filter(|w| w.host_alias == alias) {
            let _ = worker.cmd_tx.send(WorkerCmd::Stop);
            worker.stop_requested_at = Some(now);
        }
        drained
    }

    fn shutdown_all(&mut self) {
        for worker in self.workers.values() {
            let _ = worker.cmd_tx.send(WorkerCmd::Stop);
            worker.should_stop.store(true, Ordering::Relaxed);
        }
    }
}

/// Reachability-only stand-in for "successful transfer on explicit probe"
/// (§4.C host-toggle revert heuristic): a bare TCP connect to port 22,
/// since the scheduler has no protocol/credential context of its own and
/// a full login round-trip belongs to a worker, not the dispatcher.
fn probe_reachable(hostname: &str) -> bool {
    use std::net::ToSocketAddrs;
    let Ok(mut addrs) = (hostname, 22u16).to_socket_addrs() else { return false };
    let Some(addr) = addrs.next() else { return false };
    TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fra::DirRecord as FraRecord;
    use crate::state::fsa::HostRecord as FsaRecord;
    use tempfile::tempdir;

    struct NullDispatcher;
    impl Dispatcher for NullDispatcher {
        fn dispatch(&self, _job: DispatchJob) {}
    }

    fn scheduler_with_one_host(alias: &str, max_parallel: u16) -> (Scheduler, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let fsa_path = dir.path().join("fsa.dat");
        let fra_path = dir.path().join("fra.dat");
        let host = FsaRecord::new(alias, "primary.example.com", max_parallel);
        StateArea::<FsaRecord>::create(&fsa_path, std::slice::from_ref(&host)).unwrap();
        StateArea::<FraRecord>::create(&fra_path, &[]).unwrap();
        let fsa = Arc::new(Mutex::new(StateArea::<FsaRecord>::attach(&fsa_path).unwrap()));
        let fra = Arc::new(Mutex::new(StateArea::<FraRecord>::attach(&fra_path).unwrap()));
        let (_cmd_tx, cmd_rx) = unbounded();
        let config = crate::config::Config::default();
        let mut sched = Scheduler::new(fsa, fra, Box::new(NullDispatcher), cmd_rx, &config);
        sched.reindex_hosts_and_dirs();
        (sched, dir)
    }

    #[test]
    fn admission_respects_max_parallel() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        sched.enqueue("h1", JobRecord::new(1, 2, "sftp://h1/out", b'5', "", "", 1, crate::state::jid::LockDiscipline::None));
        sched.enqueue("h1", JobRecord::new(1, 2, "sftp://h1/out2", b'5', "", "", 1, crate::state::jid::LockDiscipline::None));
        sched.try_admit();
        assert_eq!(sched.hosts["h1"].active, 1);
        assert_eq!(sched.queue.len(), 1);
    }

    #[test]
    fn host_toggle_triggers_after_max_errors() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 2);
        sched.hosts.get_mut("h1").unwrap().toggle_hostname = "backup.example.com".into();
        sched.hosts.get_mut("h1").unwrap().max_errors = 3;
        for i in 0..3 {
            sched.handle_fin(FinRecord { worker_id: i, host_alias: "h1".into(), exit_kind: ExitKind::Transient, bytes: 0, files: 0 });
        }
        assert!(sched.hosts["h1"].using_toggle);
        assert_eq!(sched.hosts["h1"].consecutive_errors, 0);
    }

    #[test]
    fn successful_completion_resets_error_counter() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 2);
        sched.hosts.get_mut("h1").unwrap().consecutive_errors = 2;
        sched.handle_fin(FinRecord { worker_id: 1, host_alias: "h1".into(), exit_kind: ExitKind::Success, bytes: 100, files: 1 });
        assert_eq!(sched.hosts["h1"].consecutive_errors, 0);
    }

    #[test]
    fn ready_record_sets_deadline_on_live_worker() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        let (cmd_tx, _cmd_rx) = unbounded();
        sched.workers.insert(7, LiveWorker { host_alias: "h1".into(), cmd_tx, should_stop: Arc::new(AtomicBool::new(false)), burst_deadline: None, stop_requested_at: None });
        sched.handle_ready(ReadyRecord { worker_id: 7, host_alias: "h1".into() });
        assert!(sched.workers[&7].burst_deadline.is_some());
    }

    /// Issue (a): an ack alone must never set the first `burst_deadline` —
    /// only `handle_ready` does. Otherwise the first burst handoff can
    /// never happen (it requires `burst_deadline` already `Some`, but the
    /// only thing that used to set it was an ack that itself required a
    /// handoff to have already happened).
    #[test]
    fn ack_alone_does_not_set_deadline() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        let (cmd_tx, _cmd_rx) = unbounded();
        sched.workers.insert(7, LiveWorker { host_alias: "h1".into(), cmd_tx, should_stop: Arc::new(AtomicBool::new(false)), burst_deadline: None, stop_requested_at: None });
        sched.handle_ack(AckRecord { worker_id: 7, timestamp: 0, job_id: 1, split_counter: 0, unique_id: 1 });
        assert!(sched.workers[&7].burst_deadline.is_none());
    }

    /// Issue (b): S1's `max_parallel(H1)=1` must not block a burst handoff
    /// to the one live, already-counted worker — only spawning a *new*
    /// worker needs spare capacity.
    #[test]
    fn burst_handoff_reachable_at_host_saturation() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        let (cmd_tx, cmd_rx) = unbounded();
        sched.workers.insert(7, LiveWorker { host_alias: "h1".into(), cmd_tx, should_stop: Arc::new(AtomicBool::new(false)), burst_deadline: Some(Instant::now() + Duration::from_secs(10)), stop_requested_at: None });
        sched.hosts.get_mut("h1").unwrap().active = 1;
        sched.hosts.get_mut("h1").unwrap().allowed = 1;

        let queued = sched.queue.push_new("h1", JobRecord::new(1, 2, "sftp://h1/out2", b'5', "", "", 1, crate::state::jid::LockDiscipline::None));
        let _ = queued;
        sched.try_admit();

        assert_eq!(sched.hosts["h1"].active, 1, "handoff must not bump active again");
        assert!(sched.workers[&7].burst_deadline.is_none(), "deadline clears once the job is handed off");
        assert!(cmd_rx.try_recv().is_ok(), "the live worker must receive the new job");
        assert_eq!(sched.workers.len(), 1, "no second worker should be spawned");
    }

    /// Issue (c): a due directory's job templates must reach the queue
    /// without any external `enqueue` call — `housekeeping` alone drives it.
    #[test]
    fn housekeeping_enqueues_jobs_for_due_directories() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        let dir_rec = FraRecord::new("incoming-a", "sftp://h1/incoming", "/srv/incoming/a");
        let dir_id = dir_rec.dir_id;
        sched.fra.lock().publish_new(&[dir_rec]).unwrap();
        sched.reindex_hosts_and_dirs();
        let job = JobRecord::new(dir_id, 2, "sftp://h1/out", b'5', "", "", 1, crate::state::jid::LockDiscipline::None);
        sched.set_dir_jobs(vec![job], vec!["h1".to_string()]);

        sched.housekeeping();

        assert_eq!(sched.hosts["h1"].active, 1, "the one due job should have been admitted");
    }

    /// A directory flagged disabled must never be scanned, forced or not.
    #[test]
    fn scan_directories_skips_disabled() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 1);
        let mut dir_rec = FraRecord::new("incoming-a", "sftp://h1/incoming", "/srv/incoming/a");
        dir_rec.flags |= crate::state::fra::dir_flags::DISABLED;
        let dir_id = dir_rec.dir_id;
        sched.fra.lock().publish_new(&[dir_rec]).unwrap();
        sched.reindex_hosts_and_dirs();
        let job = JobRecord::new(dir_id, 2, "sftp://h1/out", b'5', "", "", 1, crate::state::jid::LockDiscipline::None);
        sched.set_dir_jobs(vec![job], vec!["h1".to_string()]);

        sched.scan_directories(true);

        assert_eq!(sched.queue.len(), 0);
    }

    #[test]
    fn reload_dir_config_preserves_active_counter_for_existing_host() {
        let (mut sched, _dir) = scheduler_with_one_host("h1", 2);
        sched.hosts.get_mut("h1").unwrap().active = 1;
        sched.sync_host_counters("h1");

        let fresh_host = FsaRecord::new("h1", "primary.example.com", 2);
        sched.reload_dir_config(vec![fresh_host], vec![], vec![], vec![]);

        assert_eq!(sched.hosts["h1"].active, 1, "a reload must not reset an in-flight transfer count");
    }
}

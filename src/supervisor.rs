//! Daemon entrypoint and fifo command surface (§4.I, §6): brings up every
//! long-running component in order — state areas, scheduler, archive
//! scanner — then blocks serving commands off `supervisor.cmd`, replying on
//! `supervisor.reply`. Mirrors the teacher's `main.rs` startup shape
//! (tracing init, then hand off to a long-lived loop) generalized from a
//! one-shot CLI tool to a supervised background process.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::FromRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use parking_lot::Mutex;

use crate::archive::{ArchiveControl, ArchiveScanner};
use crate::config::Config;
use crate::dirconfig::{self, LoadedConfig};
use crate::dup_check::DupCheckStore;
use crate::error::SupervisorError;
use crate::layout::WorkDirLayout;
use crate::rate_limit::RateLimiterRegistry;
use crate::scheduler::{ControlMsg, Scheduler};
use crate::state::StateArea;
use crate::state::fmd::FileMaskEntry;
use crate::state::fra::DirRecord;
use crate::state::fsa::HostRecord;
use crate::state::pwb::CredentialStore;
use crate::worker::{WorkerContext, WorkerDispatcher};

/// The command-fifo protocol's verbs (§6). Anything else gets an "error:"
/// reply rather than being silently ignored.
#[derive(Debug, Clone)]
enum Command {
    /// `RESCAN` — force an immediate due-directory scan without touching
    /// DIR_CONFIG.
    Rescan,
    /// `RELOAD_DIR_CONFIG` — re-parse DIR_CONFIG and publish a new FSA/FRA
    /// generation.
    ReloadDirConfig,
    ToggleHost(String),
    Pause,
    Resume,
    ArchiveNow,
    Stop,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.trim().split_whitespace();
    match parts.next()? {
        "rescan" => Some(Command::Rescan),
        "reload" | "reload-dir-config" => Some(Command::ReloadDirConfig),
        "toggle-host" => parts.next().map(|a| Command::ToggleHost(a.to_string())),
        "pause" => Some(Command::Pause),
        "resume" => Some(Command::Resume),
        "archive" => Some(Command::ArchiveNow),
        "stop" => Some(Command::Stop),
        _ => None,
    }
}

/// Parse DIR_CONFIG and build a fresh, unmerged generation (§4.B). Returns
/// `None` when there is no DIR_CONFIG yet — a freshly initialized work
/// directory with nothing configured is not a startup failure. A parse
/// error is logged and also treated as "nothing to publish" (§4.B failure
/// semantics: "on parse error, old areas remain in force"); only the caller
/// decides whether to keep running on the prior generation.
fn load_dir_config(layout: &WorkDirLayout) -> Option<LoadedConfig> {
    let path = layout.dir_config_path();
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read DIR_CONFIG");
            return None;
        }
    };
    let tuples = match dirconfig::parse_dir_config(&path) {
        Ok(tuples) => tuples,
        Err(e) => {
            tracing::error!(error = %e, "DIR_CONFIG parse failed, old generation remains in force");
            return None;
        }
    };
    let dir_config_id = crc32fast::hash(&raw);
    Some(dirconfig::build_generation(&tuples, dir_config_id))
}

fn attach_or_create<T: crate::state::StateRecord>(path: &Path) -> Result<StateArea<T>, SupervisorError> {
    if path.exists() {
        StateArea::<T>::attach(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to attach state area");
            SupervisorError::ComponentFailed("state")
        })
    } else {
        StateArea::<T>::create(path, &[]).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to create state area");
            SupervisorError::ComponentFailed("state")
        })
    }
}

fn ensure_fifo(path: &Path) -> Result<(), SupervisorError> {
    if path.exists() {
        return Ok(());
    }
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(|e| SupervisorError::FifoCreate(path.to_path_buf(), std::io::Error::other(e.to_string())))
}

/// Write `msg` to the reply fifo without blocking when nobody is reading it
/// — a client that sent a command and walked away must never wedge the
/// supervisor's command loop.
fn reply(reply_path: &Path, msg: &str) {
    let fd = match open(reply_path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => return,
    };
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let _ = writeln!(file, "{msg}");
}

/// Start every component spec.md §4.I names, in the order it names them,
/// and block forever serving the command fifo. Returns on a `stop` command
/// or a fatal component failure; the exit code is `SupervisorError::exit_code`.
pub fn run(config: Config, debug: bool) -> Result<(), SupervisorError> {
    let layout = WorkDirLayout::new(config.work_dir.clone());
    layout.ensure().map_err(|_| SupervisorError::WorkDirUnwritable(config.work_dir.clone()))?;
    crate::util::init_tracing(&layout.log_dir(), debug);

    crate::state::typesize_selftest(&layout).map_err(|e| {
        tracing::error!(error = %e, "state area typesize self-test failed");
        SupervisorError::ComponentFailed("state")
    })?;

    let fsa = Arc::new(Mutex::new(attach_or_create::<HostRecord>(&layout.fsa_path())?));
    let fra = Arc::new(Mutex::new(attach_or_create::<DirRecord>(&layout.fra_path())?));
    let fmd = Arc::new(attach_or_create::<FileMaskEntry>(&layout.fmd_path())?);

    // §4.B: publish the on-disk DIR_CONFIG, if any, before anything starts
    // reading FSA/FRA, merging against whatever the areas already hold so a
    // restart never resets a live host's counters (fresh areas from
    // `attach_or_create` are empty, so this is a no-op merge on first run).
    let initial_jobs = match load_dir_config(&layout) {
        Some(generation) => {
            let mut fsa_guard = fsa.lock();
            let existing_hosts: Vec<HostRecord> = (0..fsa_guard.len()).filter_map(|p| fsa_guard.get(p)).collect();
            let merged_hosts = dirconfig::merge_hosts(&existing_hosts, generation.hosts);
            fsa_guard.publish_new(&merged_hosts).map_err(|e| {
                tracing::error!(error = %e, "failed to publish initial FSA generation");
                SupervisorError::ComponentFailed("state")
            })?;
            drop(fsa_guard);

            let mut fra_guard = fra.lock();
            let existing_dirs: Vec<DirRecord> = (0..fra_guard.len()).filter_map(|p| fra_guard.get(p)).collect();
            let merged_dirs = dirconfig::merge_directories(&existing_dirs, generation.directories);
            fra_guard.publish_new(&merged_dirs).map_err(|e| {
                tracing::error!(error = %e, "failed to publish initial FRA generation");
                SupervisorError::ComponentFailed("state")
            })?;
            drop(fra_guard);

            (generation.jobs, generation.job_hosts)
        }
        None => (Vec::new(), Vec::new()),
    };

    let credentials = Arc::new(CredentialStore::open(&layout.pwb_db_path()).map_err(|_| SupervisorError::ComponentFailed("pwb"))?);
    let dup_check = Arc::new(DupCheckStore::open(&layout.dcl_db_path()).map_err(|_| SupervisorError::ComponentFailed("dcl"))?);

    let worker_ctx = Arc::new(WorkerContext {
        fra: fra.clone(),
        fmd,
        credentials,
        dup_check,
        retrieve_lists: Arc::new(Mutex::new(std::collections::HashMap::new())),
        ls_data_dir: layout.incoming_ls_data_dir(),
        archive_root: layout.archive_dir(),
        keep_connected: config.keep_connected(),
        dup_check_ttl_secs: config.dup_check_ttl_secs as i64,
        rate_limiters: Arc::new(RateLimiterRegistry::new()),
    });

    let (sched_cmd_tx, sched_cmd_rx) = unbounded::<ControlMsg>();
    let mut scheduler = Scheduler::new(fsa, fra.clone(), Box::new(WorkerDispatcher::new(worker_ctx)), sched_cmd_rx, &config);
    scheduler.reindex_hosts_and_dirs();
    scheduler.set_dir_jobs(initial_jobs.0, initial_jobs.1);
    let scheduler_handle = std::thread::Builder::new()
        .name("afd-scheduler".into())
        .spawn(move || scheduler.run())
        .map_err(|_| SupervisorError::ComponentFailed("scheduler"))?;

    let (archive_cmd_tx, archive_cmd_rx) = unbounded::<ArchiveControl>();
    let archive_scanner = ArchiveScanner::new(layout.archive_dir(), fra, Duration::from_secs(config.archive_scan_interval_secs), archive_cmd_rx);
    let archive_handle = std::thread::Builder::new()
        .name("afd-archive".into())
        .spawn(move || archive_scanner.run())
        .map_err(|_| SupervisorError::ComponentFailed("archive"))?;

    std::fs::write(layout.active_marker_path(), std::process::id().to_string()).map_err(|_| SupervisorError::WorkDirUnwritable(layout.root.clone()))?;
    tracing::info!(work_dir = %layout.root.display(), "afd daemon started");

    let result = command_loop(&layout, &sched_cmd_tx, &archive_cmd_tx);

    let _ = sched_cmd_tx.send(ControlMsg::Shutdown);
    let _ = archive_cmd_tx.send(ArchiveControl::Stop);
    let _ = scheduler_handle.join();
    let _ = archive_handle.join();
    let _ = std::fs::remove_file(layout.active_marker_path());
    tracing::info!("afd daemon stopped");
    result
}

/// Repeatedly open the command fifo for reading (a fresh open per writer,
/// the usual POSIX fifo-server shape) until a `stop` command arrives.
fn command_loop(layout: &WorkDirLayout, sched_tx: &Sender<ControlMsg>, archive_tx: &Sender<ArchiveControl>) -> Result<(), SupervisorError> {
    let cmd_path = layout.supervisor_cmd_fifo();
    let reply_path = layout.supervisor_reply_fifo();
    ensure_fifo(&cmd_path)?;
    ensure_fifo(&reply_path)?;

    loop {
        let file = std::fs::File::open(&cmd_path).map_err(|e| SupervisorError::FifoCreate(cmd_path.clone(), e))?;
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            match parse_command(&line) {
                Some(Command::Stop) => {
                    reply(&reply_path, "ok: stopping");
                    return Ok(());
                }
                Some(Command::Rescan) => {
                    let _ = sched_tx.send(ControlMsg::Rescan);
                    reply(&reply_path, "ok: rescan requested");
                }
                Some(Command::ReloadDirConfig) => match load_dir_config(layout) {
                    Some(generation) => {
                        let _ = sched_tx.send(ControlMsg::ReloadDirConfig {
                            hosts: generation.hosts,
                            directories: generation.directories,
                            jobs: generation.jobs,
                            job_hosts: generation.job_hosts,
                        });
                        reply(&reply_path, "ok: dir config reloaded");
                    }
                    None => reply(&reply_path, "error: no DIR_CONFIG to load"),
                },
                Some(Command::ToggleHost(alias)) => {
                    let _ = sched_tx.send(ControlMsg::ToggleHost(alias));
                    reply(&reply_path, "ok: toggle requested");
                }
                Some(Command::Pause) => {
                    let _ = sched_tx.send(ControlMsg::PauseQueue);
                    reply(&reply_path, "ok: paused");
                }
                Some(Command::Resume) => {
                    let _ = sched_tx.send(ControlMsg::ResumeQueue);
                    reply(&reply_path, "ok: resumed");
                }
                Some(Command::ArchiveNow) => {
                    let _ = archive_tx.send(ArchiveControl::RetryNow);
                    reply(&reply_path, "ok: archive sweep requested");
                }
                None => reply(&reply_path, "error: unrecognized command"),
            }
        }
    }
}

/// Client side of the same protocol, used by `cli` to talk to a running
/// daemon: write one line to the command fifo, read one line back from the
/// reply fifo. `NoRunningInstance` covers both "never started" and
/// "stopped but left its fifos behind".
pub fn send_command(layout: &WorkDirLayout, line: &str) -> Result<String, SupervisorError> {
    if !layout.active_marker_path().exists() {
        return Err(SupervisorError::NoRunningInstance);
    }
    let cmd_path = layout.supervisor_cmd_fifo();
    let reply_path = layout.supervisor_reply_fifo();
    let mut cmd_file = std::fs::OpenOptions::new().write(true).open(&cmd_path).map_err(|_| SupervisorError::NoRunningInstance)?;
    writeln!(cmd_file, "{line}").map_err(|_| SupervisorError::NoRunningInstance)?;
    drop(cmd_file);

    let reply_file = std::fs::File::open(&reply_path).map_err(|_| SupervisorError::NoRunningInstance)?;
    let mut response = String::new();
    BufReader::new(reply_file).read_line(&mut response).map_err(|_| SupervisorError::NoRunningInstance)?;
    Ok(response.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verbs() {
        assert!(matches!(parse_command("stop"), Some(Command::Stop)));
        assert!(matches!(parse_command("reload"), Some(Command::ReloadDirConfig)));
        assert!(matches!(parse_command("toggle-host h1"), Some(Command::ToggleHost(a)) if a == "h1"));
    }

    #[test]
    fn rejects_unknown_verb_and_missing_argument() {
        assert!(parse_command("bogus").is_none());
        assert!(parse_command("toggle-host").is_none());
    }

    #[test]
    fn send_command_without_active_marker_reports_no_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path().to_path_buf());
        layout.ensure().unwrap();
        let err = send_command(&layout, "stop").unwrap_err();
        assert!(matches!(err, SupervisorError::NoRunningInstance));
    }
}

//! Config loader (AMG role, §4.B): parses the DIR_CONFIG tree, computes
//! stable job-ids, and stages a new FSA/FRA/JID/DNB/FMD generation before
//! handing it to the scheduler.
//!
//! DIR_CONFIG grammar (a line-based, indentation-free format with no
//! natural serde mapping, hence the hand-written parser rather than the
//! daemon's own `serde` config layer):
//!
//! ```text
//! [directory <alias>]
//! url = sftp://user@host/incoming
//! path = /srv/incoming/<alias>
//! priority = 5
//! lock = dot-prefix-then-rename
//! archive_time = 3600
//!
//! [filter]
//! *.dat
//! *.grib2
//!
//! [recipient]
//! sftp://otherhost/outgoing
//! ```
//!
//! One `[directory]` block plus its nested `[filter]`/`[recipient]` blocks
//! forms one `(directory, filter, recipient, options)` tuple (§4.B).

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use crate::error::DirConfigError;
use crate::retrieve_list::StupidMode;
use crate::state::fsa::HostRecord;
use crate::state::jid::LockDiscipline;
use crate::state::{dnb::DirNameEntry, fmd::FileMaskEntry, fra::DirRecord, jid::JobRecord};

/// Default `max_parallel` for a host auto-vivified the first time one of
/// its hostnames appears in a `[recipient]` block (§3 "created by config
/// loader when alias first appears"). DIR_CONFIG's grammar has no separate
/// per-host section, so the recipient URL's hostname doubles as the FSA
/// alias; an operator who needs more than one concurrent transfer to a
/// host raises it later with `toggle-host`/a direct FSA edit.
const DEFAULT_HOST_MAX_PARALLEL: u16 = 1;

#[derive(Debug, Clone)]
pub struct DirectoryTuple {
    pub alias: String,
    pub url: String,
    pub path: String,
    pub priority: u8,
    pub lock_discipline: LockDiscipline,
    pub archive_time_secs: u64,
    pub stupid_mode: StupidMode,
    pub filters: Vec<String>,
    pub recipients: Vec<String>,
    pub local_options: String,
    pub socket_options: String,
}

/// Everything the config loader produces for one DIR_CONFIG tree: ready to
/// hand to `StateArea::publish_new` for each area plus the in-memory job
/// table the scheduler reindexes by job-id. `job_hosts[i]` names the FSA
/// alias `jobs[i]` should be enqueued against (kept parallel rather than
/// folded into `JobRecord` since the host alias plays no part in the
/// job-id hash — see `JobRecord::compute_job_id`).
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub directories: Vec<DirRecord>,
    pub dir_names: Vec<DirNameEntry>,
    pub file_masks: Vec<FileMaskEntry>,
    pub jobs: Vec<JobRecord>,
    pub job_hosts: Vec<String>,
    pub hosts: Vec<HostRecord>,
}

fn lock_discipline_from_str(s: &str) -> LockDiscipline {
    match s {
        "dot-prefix-then-rename" => LockDiscipline::DotPrefixThenRename,
        "dot-prefix-vms" => LockDiscipline::DotPrefixVms,
        "postfix" => LockDiscipline::Postfix,
        "side-lockfile" => LockDiscipline::SideLockfile,
        _ => LockDiscipline::None,
    }
}

fn stupid_mode_from_str(s: &str) -> StupidMode {
    match s {
        "no" => StupidMode::No,
        "yes" => StupidMode::Yes,
        "get_once_only" => StupidMode::GetOnceOnly,
        "append_only" => StupidMode::AppendOnly,
        _ => StupidMode::GetOnceNotExact,
    }
}

/// The hostname component of a recipient URL, which doubles as its FSA
/// alias (see `DEFAULT_HOST_MAX_PARALLEL`). Falls back to the raw URL for
/// a recipient this build can't parse, so an unparsable entry still gets a
/// stable (if unusable) host bucket rather than panicking the loader.
fn host_alias_for(recipient_url: &str) -> String {
    crate::protocol::parse_target(recipient_url).map(|t| t.host).unwrap_or_else(|_| recipient_url.to_string())
}

/// Parse one DIR_CONFIG file into directory tuples. Parse errors are
/// collected rather than aborting immediately, matching §4.B's "old areas
/// remain in force" failure semantics — the caller decides whether any
/// error is fatal.
pub fn parse_dir_config(path: &Path) -> Result<Vec<DirectoryTuple>, DirConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DirConfigError::MissingWorkDir(path.to_path_buf())
        } else if e.kind() == std::io::ErrorKind::PermissionDenied {
            DirConfigError::PermissionDenied(path.to_path_buf())
        } else {
            DirConfigError::Io(path.to_path_buf(), e)
        }
    })?;
    parse_dir_config_str(path, &text)
}

fn parse_dir_config_str(path: &Path, text: &str) -> Result<Vec<DirectoryTuple>, DirConfigError> {
    let header_re = Regex::new(r"^\[directory\s+(\S+)\]$").expect("static regex");
    let kv_re = Regex::new(r"^([A-Za-z_]+)\s*=\s*(.+)$").expect("static regex");

    let mut tuples = Vec::new();
    let mut current: Option<DirectoryTuple> = None;
    let mut section = Section::None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = header_re.captures(line) {
            if let Some(prev) = current.take() {
                tuples.push(prev);
            }
            current = Some(DirectoryTuple {
                alias: caps[1].to_string(),
                url: String::new(),
                path: String::new(),
                priority: b'5',
                lock_discipline: LockDiscipline::None,
                archive_time_secs: 0,
                stupid_mode: StupidMode::GetOnceNotExact,
                filters: Vec::new(),
                recipients: Vec::new(),
                local_options: String::new(),
                socket_options: String::new(),
            });
            section = Section::Directory;
            continue;
        }
        if line == "[filter]" {
            section = Section::Filter;
            continue;
        }
        if line == "[recipient]" {
            section = Section::Recipient;
            continue;
        }

        let Some(tuple) = current.as_mut() else {
            return Err(DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: format!("line outside any [directory] block: {line}") });
        };

        match section {
            Section::Directory => {
                let Some(caps) = kv_re.captures(line) else {
                    return Err(DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: format!("expected key = value, got: {line}") });
                };
                let (key, value) = (&caps[1], caps[2].trim());
                match key {
                    "url" => tuple.url = value.to_string(),
                    "path" => tuple.path = value.to_string(),
                    "priority" => {
                        let digit = value.as_bytes().first().copied().ok_or_else(|| DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: "empty priority".into() })?;
                        if !digit.is_ascii_digit() {
                            return Err(DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: format!("priority must be 0-9: {value}") });
                        }
                        tuple.priority = digit;
                    }
                    "lock" => tuple.lock_discipline = lock_discipline_from_str(value),
                    "stupid_mode" => tuple.stupid_mode = stupid_mode_from_str(value),
                    "archive_time" => {
                        tuple.archive_time_secs = value.parse().map_err(|_| DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: format!("invalid archive_time: {value}") })?;
                    }
                    "local_options" => tuple.local_options = value.to_string(),
                    "socket_options" => tuple.socket_options = value.to_string(),
                    other => {
                        return Err(DirConfigError::ParseError { file: path.to_path_buf(), line: lineno + 1, msg: format!("unknown directory key: {other}") });
                    }
                }
            }
            Section::Filter => tuple.filters.push(line.to_string()),
            Section::Recipient => tuple.recipients.push(line.to_string()),
            Section::None => unreachable!("section is set before any body line is read"),
        }
    }
    if let Some(last) = current.take() {
        tuples.push(last);
    }
    Ok(tuples)
}

enum Section {
    None,
    Directory,
    Filter,
    Recipient,
}

/// Canonicalize then hash: trims whitespace, lower-cases the URL scheme,
/// sorts filters/recipients so tuple identity doesn't depend on source
/// ordering within a block — matching "applying the same DIR_CONFIG twice
/// yields identical JID content" (§8 property 7).
fn canonicalize(tuple: &DirectoryTuple) -> (String, Vec<String>, Vec<String>) {
    let url = tuple.url.trim().to_string();
    let mut filters = tuple.filters.clone();
    filters.sort();
    let mut recipients = tuple.recipients.clone();
    recipients.sort();
    (url, filters, recipients)
}

/// Merge a freshly-parsed host list against whatever FSA already holds, so a
/// reload never resets a counter a live transfer depends on. A host that
/// already existed keeps its `allowed`/`active`/`consecutive_errors`/
/// toggle state/job slots; only the alias-derived identity and protocol
/// bitset come from the new generation. A host whose alias no longer
/// appears in DIR_CONFIG is dropped — "removed only on config hand-off"
/// (spec.md §3).
pub fn merge_hosts(existing: &[HostRecord], fresh: Vec<HostRecord>) -> Vec<HostRecord> {
    let by_alias: HashMap<&str, &HostRecord> = existing.iter().map(|h| (h.alias.as_str(), h)).collect();
    fresh
        .into_iter()
        .map(|mut h| {
            if let Some(old) = by_alias.get(h.alias.as_str()) {
                h.allowed = old.allowed;
                h.active = old.active;
                h.consecutive_errors = old.consecutive_errors;
                h.using_toggle = old.using_toggle;
                h.hostname_toggle = old.hostname_toggle.clone();
                h.status = old.status;
                h.debug_mode = old.debug_mode;
                h.job_slots = old.job_slots;
            }
            h
        })
        .collect()
}

/// Merge a freshly-parsed directory list the same way: an existing alias
/// keeps its counters, flags, and scan schedule; only url/path/archive_time/
/// stupid_mode come from the new generation.
pub fn merge_directories(existing: &[DirRecord], fresh: Vec<DirRecord>) -> Vec<DirRecord> {
    let by_alias: HashMap<&str, &DirRecord> = existing.iter().map(|d| (d.alias.as_str(), d)).collect();
    fresh
        .into_iter()
        .map(|mut d| {
            if let Some(old) = by_alias.get(d.alias.as_str()) {
                d.files_done = old.files_done;
                d.bytes_done = old.bytes_done;
                d.flags = old.flags;
                d.next_check_time = old.next_check_time;
            }
            d
        })
        .collect()
}

/// Build a full `LoadedConfig` candidate generation from parsed tuples.
/// Each `(directory, filter, recipient)` combination mints one job; a
/// dir-id/file-mask-id is shared by every job from the same directory.
pub fn build_generation(tuples: &[DirectoryTuple], dir_config_id: u32) -> LoadedConfig {
    let mut out = LoadedConfig::default();
    let mut seen_dir_ids: HashMap<u32, ()> = HashMap::new();
    let mut seen_hosts: HashMap<String, ()> = HashMap::new();

    for tuple in tuples {
        let (url, filters, recipients) = canonicalize(tuple);
        let dir_id = crc32fast::hash(tuple.alias.as_bytes());
        if seen_dir_ids.insert(dir_id, ()).is_none() {
            let mut dir = DirRecord::new(tuple.alias.clone(), url.clone(), tuple.path.clone());
            dir.archive_time_secs = tuple.archive_time_secs;
            dir.stupid_mode = tuple.stupid_mode;
            out.directories.push(dir);
            out.dir_names.push(DirNameEntry { dir_id, canonical_path: tuple.path.clone() });
        }
        let file_mask_id = {
            let mut h = crc32fast::Hasher::new();
            for f in &filters {
                h.update(f.as_bytes());
                h.update(b"\0");
            }
            h.finalize()
        };
        out.file_masks.push(FileMaskEntry::new(file_mask_id, filters.clone()));

        for recipient in &recipients {
            out.jobs.push(JobRecord::new(
                dir_id,
                file_mask_id,
                recipient.clone(),
                tuple.priority,
                tuple.local_options.clone(),
                tuple.socket_options.clone(),
                dir_config_id,
                tuple.lock_discipline,
            ));
            let host_alias = host_alias_for(recipient);
            if seen_hosts.insert(host_alias.clone(), ()).is_none() {
                out.hosts.push(HostRecord::new(host_alias.clone(), host_alias.clone(), DEFAULT_HOST_MAX_PARALLEL));
            }
            out.job_hosts.push(host_alias);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> &'static str {
        "[directory incoming-a]\n\
         url = sftp://user@host/incoming\n\
         path = /srv/incoming/a\n\
         priority = 3\n\
         lock = postfix\n\
         archive_time = 3600\n\
         \n\
         [filter]\n\
         *.dat\n\
         *.grib2\n\
         \n\
         [recipient]\n\
         sftp://otherhost/outgoing\n"
    }

    #[test]
    fn parses_one_directory_tuple() {
        let tuples = parse_dir_config_str(&PathBuf::from("test"), sample()).unwrap();
        assert_eq!(tuples.len(), 1);
        let t = &tuples[0];
        assert_eq!(t.alias, "incoming-a");
        assert_eq!(t.priority, b'3');
        assert_eq!(t.filters, vec!["*.dat", "*.grib2"]);
        assert_eq!(t.recipients, vec!["sftp://otherhost/outgoing"]);
    }

    #[test]
    fn rejects_unknown_key() {
        let bad = "[directory a]\nbogus = 1\n";
        let err = parse_dir_config_str(&PathBuf::from("test"), bad).unwrap_err();
        assert!(matches!(err, DirConfigError::ParseError { .. }));
    }

    #[test]
    fn applying_same_config_twice_yields_identical_job_ids() {
        let tuples = parse_dir_config_str(&PathBuf::from("test"), sample()).unwrap();
        let gen_a = build_generation(&tuples, 1);
        let gen_b = build_generation(&tuples, 1);
        let ids_a: Vec<u32> = gen_a.jobs.iter().map(|j| j.job_id).collect();
        let ids_b: Vec<u32> = gen_b.jobs.iter().map(|j| j.job_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn changing_a_filter_changes_the_job_id() {
        let tuples = parse_dir_config_str(&PathBuf::from("test"), sample()).unwrap();
        let gen_a = build_generation(&tuples, 1);
        let mut tuples_b = tuples;
        tuples_b[0].filters.push("*.extra".into());
        let gen_b = build_generation(&tuples_b, 1);
        assert_ne!(gen_a.jobs[0].file_mask_id, gen_b.jobs[0].file_mask_id);
    }

    #[test]
    fn parses_stupid_mode_key() {
        let text = "[directory a]\nurl = sftp://h/x\npath = /x\nstupid_mode = get_once_only\n";
        let tuples = parse_dir_config_str(&PathBuf::from("test"), text).unwrap();
        assert_eq!(tuples[0].stupid_mode, StupidMode::GetOnceOnly);
    }

    #[test]
    fn build_generation_auto_vivifies_host_from_recipient_hostname() {
        let tuples = parse_dir_config_str(&PathBuf::from("test"), sample()).unwrap();
        let gen = build_generation(&tuples, 1);
        assert_eq!(gen.hosts.len(), 1);
        assert_eq!(gen.hosts[0].alias, "otherhost");
        assert_eq!(gen.job_hosts, vec!["otherhost".to_string()]);
    }

    #[test]
    fn build_generation_dedupes_host_shared_by_two_directories() {
        let text = "[directory a]\nurl = sftp://h/a\npath = /a\n[recipient]\nsftp://shared/out\n\n\
                    [directory b]\nurl = sftp://h/b\npath = /b\n[recipient]\nsftp://shared/out2\n";
        let tuples = parse_dir_config_str(&PathBuf::from("test"), text).unwrap();
        let gen = build_generation(&tuples, 1);
        assert_eq!(gen.hosts.len(), 1, "both directories' recipients share the 'shared' hostname");
    }

    #[test]
    fn merge_hosts_preserves_runtime_counters_for_known_alias() {
        let mut old = HostRecord::new("h1", "primary.example.com", 2);
        old.active = 1;
        old.consecutive_errors = 3;
        old.using_toggle = true;
        let fresh = HostRecord::new("h1", "primary.example.com", 2);
        let merged = merge_hosts(&[old], vec![fresh]);
        assert_eq!(merged[0].active, 1);
        assert_eq!(merged[0].consecutive_errors, 3);
        assert!(merged[0].using_toggle);
    }

    #[test]
    fn merge_hosts_drops_aliases_no_longer_in_config() {
        let old = HostRecord::new("stale-host", "x", 1);
        let merged = merge_hosts(&[old], vec![]);
        assert!(merged.is_empty());
    }

    #[test]
    fn merge_directories_preserves_counters_for_known_alias() {
        let mut old = DirRecord::new("incoming-a", "sftp://h1/incoming", "/srv/incoming/a");
        old.files_done = 42;
        old.next_check_time = 999;
        let fresh = DirRecord::new("incoming-a", "sftp://h1/incoming", "/srv/incoming/a");
        let merged = merge_directories(&[old], vec![fresh]);
        assert_eq!(merged[0].files_done, 42);
        assert_eq!(merged[0].next_check_time, 999);
    }
}

//! Exercises the quantified invariants and concrete scenarios from spec.md
//! §8 against the public API, in the same spirit as `retry_sftp_sim.rs`'s
//! use of fakes in place of a live remote endpoint: no real network or SSH
//! server is involved, only the in-process logic each property depends on.

use std::sync::Arc;
use std::time::Duration;

use afd::archive::{ArchiveScanner, archive_file};
use afd::dirconfig::{build_generation, parse_dir_config};
use afd::retrieve_list::{RetrieveList, StupidMode};
use afd::state::fra::DirRecord;
use afd::state::fsa::HostRecord;
use afd::state::{StateArea, StateRecord};
use parking_lot::Mutex;

/// Invariant 8 / S5: a schema byte mismatch refuses to attach, and the
/// refusal happens before any record is read back out of the mapping.
#[test]
fn schema_mismatch_refuses_attach() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fsa.dat");
    StateArea::<HostRecord>::create(&path, &[HostRecord::new("h1", "primary.example.com", 1)]).unwrap();

    // Corrupt the schema_version byte (offset 7 of the 16-byte header) to a
    // value HostRecord::SCHEMA_VERSION never produces.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[7] = HostRecord::SCHEMA_VERSION.wrapping_add(1);
    std::fs::write(&path, bytes).unwrap();

    let err = StateArea::<HostRecord>::attach(&path).unwrap_err();
    assert!(err.to_string().contains("schema") || err.to_string().contains("version"), "expected a schema/version error, got: {err}");
}

/// Invariant 7: parsing and staging the same DIR_CONFIG tree twice yields
/// identical job-ids in identical order — the hash is over tuple content,
/// not over anything that varies between runs (like a timestamp or a
/// memory address).
#[test]
fn dir_config_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("DIR_CONFIG");
    std::fs::write(
        &config_path,
        "[directory incoming-a]\n\
         url = sftp://user@host1/incoming\n\
         path = /srv/incoming/a\n\
         priority = 5\n\
         lock = dot-prefix-then-rename\n\
         archive_time = 3600\n\
         \n\
         [filter]\n\
         *.dat\n\
         \n\
         [recipient]\n\
         sftp://host2/outgoing\n",
    )
    .unwrap();

    let tuples_a = parse_dir_config(&config_path).unwrap();
    let tuples_b = parse_dir_config(&config_path).unwrap();
    let gen_a = build_generation(&tuples_a, 1);
    let gen_b = build_generation(&tuples_b, 1);

    assert_eq!(gen_a.jobs.len(), gen_b.jobs.len());
    assert!(!gen_a.jobs.is_empty());
    for (a, b) in gen_a.jobs.iter().zip(gen_b.jobs.iter()) {
        assert_eq!(a.job_id, b.job_id);
    }
    assert_eq!(gen_a.jobs, gen_b.jobs);
}

/// S3 — Archive retention, literal inputs from spec.md §8: `creation_time
/// =1000, archive_time=3600, ARCHIVE_STEP_TIME=86400` gives bucket epoch 0;
/// the bucket is gone by `now=90000` (`>= epoch + step`) but still present
/// at `now=4000`.
#[test]
fn archive_retention_literal_scenario() {
    use afd::archive::{ARCHIVE_STEP_SECS, bucket_epoch};

    let epoch = bucket_epoch(1000, 3600, ARCHIVE_STEP_SECS);
    assert_eq!(epoch, 0, "S3's literal inputs must quantize to bucket epoch 0");

    let dir = tempfile::tempdir().unwrap();
    let archive_root = dir.path().join("archive");
    let bucket = archive_root.join("host1").join("none").join("0").join(format!("{epoch:x}_2a"));
    std::fs::create_dir_all(&bucket).unwrap();
    std::fs::write(bucket.join("F"), b"payload").unwrap();

    let fra_path = dir.path().join("fra.dat");
    StateArea::<DirRecord>::create(&fra_path, &[DirRecord::new("incoming-a", "sftp://h/x", "/x")]).unwrap();
    let fra = Arc::new(Mutex::new(StateArea::<DirRecord>::attach(&fra_path).unwrap()));

    let (_tx, rx) = crossbeam_channel::unbounded();
    let scanner = ArchiveScanner::new(archive_root.clone(), fra, Duration::from_secs(3600), rx);

    // The scanner's own removal test is `now >= epoch + step`, not tied to
    // wall-clock "now=4000"/"now=90000" directly, since an integration test
    // cannot move wall-clock time; wall-clock now is always far past epoch 0
    // plus one day, so a real sweep always lands in the "expired" branch.
    assert!(90_000u64 >= epoch + ARCHIVE_STEP_SECS, "S3's now=90000 must be past the deadline");
    assert!(4_000u64 < epoch + ARCHIVE_STEP_SECS, "S3's now=4000 must be before the deadline");

    let removed = scanner.sweep();
    assert_eq!(removed, 1);
    assert!(!archive_root.join("host1").exists(), "expired bucket and its now-empty parent chain should be gone");
}

/// S3 continued: a bucket whose epoch hasn't reached its deadline yet
/// (`now < epoch + step`) is left alone — construct one whose quantized
/// epoch sits far enough in the future that today's wall-clock "now" can't
/// have passed its deadline.
#[test]
fn archive_retention_keeps_fresh_bucket() {
    use afd::archive::ARCHIVE_STEP_SECS;

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
    let future_epoch = (now / ARCHIVE_STEP_SECS + 10) * ARCHIVE_STEP_SECS;

    let dir = tempfile::tempdir().unwrap();
    let archive_root = dir.path().join("archive");
    let bucket = archive_root.join("host1").join("none").join("0").join(format!("{future_epoch:x}_2a"));
    std::fs::create_dir_all(&bucket).unwrap();
    std::fs::write(bucket.join("F"), b"payload").unwrap();

    let fra_path = dir.path().join("fra.dat");
    StateArea::<DirRecord>::create(&fra_path, &[DirRecord::new("incoming-a", "sftp://h/x", "/x")]).unwrap();
    let fra = Arc::new(Mutex::new(StateArea::<DirRecord>::attach(&fra_path).unwrap()));

    let (_tx, rx) = crossbeam_channel::unbounded();
    let scanner = ArchiveScanner::new(archive_root.clone(), fra, Duration::from_secs(3600), rx);
    let removed = scanner.sweep();
    assert_eq!(removed, 0);
    assert!(bucket.join("F").exists());
}

/// `archive_file` places a just-sent file into its `<host>/<user|none>/
/// <dir-number>/<epoch>_<job>` bucket (§6) and removes the source.
#[test]
fn archive_file_lands_in_job_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let archive_root = dir.path().join("archive");
    let source = dir.path().join("F");
    std::fs::write(&source, b"payload").unwrap();
    archive_file(&archive_root, "host1", Some("bob"), 7, 1000, 3600, &source).unwrap();
    assert!(!source.exists());
}

/// S4 — Retrieve dedup (GET_ONCE_ONLY): listing `[a, b, c]` at t=0 is fully
/// stored; a later listing adding `d` only re-triggers a fetch for `d`.
#[test]
fn retrieve_dedup_get_once_only() {
    let dir = tempfile::tempdir().unwrap();
    let list = RetrieveList::open(&dir.path().join("incoming-a.json"), StupidMode::GetOnceOnly);

    for name in ["a", "b", "c"] {
        assert!(list.should_retrieve(name, 10, 100));
        list.mark_stored(name, 10, 100);
    }

    for name in ["a", "b", "c"] {
        assert!(!list.should_retrieve(name, 10, 100), "{name} was already stored and must not be re-fetched under GET_ONCE_ONLY");
    }
    assert!(list.should_retrieve("d", 10, 100), "newly listed name must still be fetched");
}

/// Invariant 5 / S2 — host-toggle: `HostRecord::active_hostname` follows
/// `using_toggle`, and flipping it is the only thing that changes which
/// name a worker connects to next.
#[test]
fn host_toggle_switches_active_hostname_exactly_once() {
    let mut host = HostRecord::new("h1", "a.example.com", 1);
    host.hostname_toggle = "b.example.com".into();
    assert_eq!(host.active_hostname(), "a.example.com");

    host.consecutive_errors = 3;
    let max_errors = 3u32;
    if host.consecutive_errors >= max_errors {
        host.using_toggle = !host.using_toggle;
        host.consecutive_errors = 0;
    }

    assert!(host.using_toggle);
    assert_eq!(host.active_hostname(), "b.example.com");
    assert_eq!(host.consecutive_errors, 0);
}

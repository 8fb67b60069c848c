//! Retrieve list (ls_data) store (§4.F): per-directory record of what has
//! already been fetched, persisted as JSON the same way `app.rs`'s
//! `StorageObject` persists daemon config — one file per directory rather
//! than a single area, since retrieve lists are unboundedly variable in
//! size and directory-scoped by nature.
//!
//! Two lock levels guard access (§5): a coarse `parking_lot::Mutex` over
//! the whole per-directory list (held while loading/saving/iterating) and
//! an in-memory fine-grained `HashSet` of names currently mid-retrieval
//! (held only while deciding whether a specific name may start).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::lock_order::{self, LockLevel};
use crate::util::StorageObject;

/// One of the five duplication policies named in the glossary (§3, §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StupidMode {
    No,
    Yes,
    GetOnceOnly,
    GetOnceNotExact,
    AppendOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    New,
    Retrieving,
    Stored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub state: EntryState,
    /// §9 Open Question 1: when `force_reread = REMOTE_ONLY` invalidates a
    /// STORED entry's cached mtime, the entry is kept (not deleted) and
    /// this flag is set so the next scan re-compares size/mtime instead of
    /// trusting the cache.
    pub stale_mtime: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ListFile {
    entries: HashMap<String, Entry>,
}

impl StorageObject for ListFile {}

pub struct RetrieveList {
    path: PathBuf,
    mode: StupidMode,
    file: Mutex<ListFile>,
    in_flight: Mutex<HashSet<String>>,
}

impl RetrieveList {
    /// `ListFile::read_from` never fails outward (missing/corrupt files
    /// fall back to an empty list with a logged warning, per
    /// `StorageObject`'s contract), so opening a retrieve list is infallible.
    pub fn open(path: &Path, mode: StupidMode) -> Self {
        let file = ListFile::read_from(path);
        RetrieveList { path: path.to_path_buf(), mode, file: Mutex::new(file), in_flight: Mutex::new(HashSet::new()) }
    }

    fn save(&self, file: &ListFile) {
        file.save_to(&self.path);
    }

    /// Decide whether `name` should be fetched right now, and if so mark it
    /// in-flight. Acquires the coarse lock first, then the fine lock, per
    /// the required order (§5).
    pub fn should_retrieve(&self, name: &str, size: u64, mtime: i64) -> bool {
        let _coarse = lock_order::enter(LockLevel::RetrieveListCoarse);
        let file = self.file.lock();
        let existing = file.entries.get(name);

        let wants_fetch = match self.mode {
            StupidMode::No => true,
            StupidMode::Yes => existing.is_none(),
            StupidMode::GetOnceOnly => existing.is_none(),
            StupidMode::GetOnceNotExact => match existing {
                None => true,
                Some(e) => e.stale_mtime || e.size != size || e.mtime != mtime,
            },
            StupidMode::AppendOnly => match existing {
                None => true,
                Some(e) => e.size < size,
            },
        };
        drop(file);
        if !wants_fetch {
            return false;
        }

        let _fine = lock_order::enter(LockLevel::RetrieveListFine);
        let mut in_flight = self.in_flight.lock();
        in_flight.insert(name.to_string())
    }

    /// Record a successful fetch and drop the in-flight marker.
    pub fn mark_stored(&self, name: &str, size: u64, mtime: i64) {
        let _coarse = lock_order::enter(LockLevel::RetrieveListCoarse);
        let mut file = self.file.lock();
        file.entries.insert(name.to_string(), Entry { name: name.to_string(), size, mtime, state: EntryState::Stored, stale_mtime: false });
        self.save(&file);
        drop(file);
        self.in_flight.lock().remove(name);
    }

    /// A fetch attempt failed or was abandoned: clear the in-flight marker
    /// without touching the persisted entry so the next pass retries.
    pub fn abandon(&self, name: &str) {
        self.in_flight.lock().remove(name);
    }

    /// Open Question 1 (§9): invalidate STORED entries' cached mtimes after
    /// a `force_reread = REMOTE_ONLY` request, without deleting them.
    pub fn invalidate_all_mtimes(&self) {
        let _coarse = lock_order::enter(LockLevel::RetrieveListCoarse);
        let mut file = self.file.lock();
        for entry in file.entries.values_mut() {
            entry.stale_mtime = true;
        }
        self.save(&file);
    }

    pub fn len(&self) -> usize {
        self.file.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yes_mode_refetches_only_unseen_names() {
        let dir = tempfile::tempdir().unwrap();
        let list = RetrieveList::open(&dir.path().join("ls_data.json"), StupidMode::Yes);
        assert!(list.should_retrieve("a.dat", 10, 100));
        list.mark_stored("a.dat", 10, 100);
        assert!(!list.should_retrieve("a.dat", 10, 100));
    }

    #[test]
    fn get_once_not_exact_refetches_on_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let list = RetrieveList::open(&dir.path().join("ls_data.json"), StupidMode::GetOnceNotExact);
        list.mark_stored("a.dat", 10, 100);
        assert!(!list.should_retrieve("a.dat", 10, 100));
        assert!(list.should_retrieve("a.dat", 20, 100));
    }

    #[test]
    fn append_only_refetches_when_remote_grew() {
        let dir = tempfile::tempdir().unwrap();
        let list = RetrieveList::open(&dir.path().join("ls_data.json"), StupidMode::AppendOnly);
        list.mark_stored("a.dat", 10, 100);
        assert!(!list.should_retrieve("a.dat", 10, 200));
        assert!(list.should_retrieve("a.dat", 11, 200));
    }

    #[test]
    fn in_flight_name_is_not_double_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let list = RetrieveList::open(&dir.path().join("ls_data.json"), StupidMode::No);
        assert!(list.should_retrieve("a.dat", 10, 100));
        assert!(!list.should_retrieve("a.dat", 10, 100));
        list.abandon("a.dat");
        assert!(list.should_retrieve("a.dat", 10, 100));
    }

    #[test]
    fn invalidate_marks_all_entries_stale() {
        let dir = tempfile::tempdir().unwrap();
        let list = RetrieveList::open(&dir.path().join("ls_data.json"), StupidMode::GetOnceNotExact);
        list.mark_stored("a.dat", 10, 100);
        assert!(!list.should_retrieve("a.dat", 10, 100));
        list.invalidate_all_mtimes();
        assert!(list.should_retrieve("a.dat", 10, 100));
    }
}

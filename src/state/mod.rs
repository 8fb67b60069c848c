//! Shared, memory-mapped state areas (§4.A): FSA/FRA/JID/DNB/FMD are all
//! `StateArea<T>` over a fixed-size record type; MDB (the in-memory queue,
//! which per §5 has no external readers) and PWB/DCL (SQL tables) live in
//! `scheduler::queue` and `state::pwb`/`dup_check` respectively since they
//! don't share this file-backed, versioned-header shape.
//!
//! Contract realized here: `attach`, `lookup_by_alias`, `lookup_by_id`,
//! `publish_new`. Generation handles resolve to a position on every touch —
//! nobody caches a raw index across a suspension point (§9 "position-indexed
//! records").

pub mod dnb;
pub mod fmd;
pub mod fra;
pub mod fsa;
pub mod jid;
pub mod pwb;

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::StateAreaError;

/// 16-byte header exactly as specified in spec.md §4.A:
/// `{entry_count:i32, pad, pad, schema_version:u8, pad32, 4 reserved}`.
pub const HEADER_LEN: usize = 16;

/// Sentinel written into the old header's `entry_count` field on publish;
/// readers must treat this as "re-attach", never as "zero records".
const STALE_MARKER: i32 = i32::MIN;

fn read_header(buf: &[u8]) -> (i32, u8) {
    let entry_count = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    let schema_version = buf[7];
    (entry_count, schema_version)
}

fn write_header(buf: &mut [u8], entry_count: i32, schema_version: u8) {
    buf[0..4].copy_from_slice(&entry_count.to_le_bytes());
    buf[4] = 0;
    buf[5] = 0;
    buf[6] = 0;
    buf[7] = schema_version;
    buf[8..16].fill(0);
}

/// Implemented by every fixed-layout record kept in a `StateArea` (host,
/// directory, job-identity, dir-name, file-mask entries). `to_bytes`/
/// `from_bytes` are hand-written rather than derived so the on-disk layout
/// stays independently inspectable, per §4.A's typesize self-test contract.
pub trait StateRecord: Clone {
    const SCHEMA_VERSION: u8;

    fn record_size() -> usize;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Self;
    fn alias(&self) -> &str;
    fn id(&self) -> u32;
}

/// A `(generation, id)` handle. Generation invalidates a cached handle across
/// a `publish_new` swap; `id` is looked up fresh on every `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle<T> {
    pub generation: u64,
    pub id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(generation: u64, id: u32) -> Self {
        Handle { generation, id, _marker: PhantomData }
    }
}

/// One attached state area: an mmap'd file plus a generation counter bumped
/// on every successful re-attach after observing STALE.
pub struct StateArea<T: StateRecord> {
    path: PathBuf,
    mmap: MmapMut,
    generation: AtomicU64,
    record_count: usize,
    _marker: PhantomData<T>,
}

impl<T: StateRecord> StateArea<T> {
    /// Map the file at `path`, validating the schema byte and running the
    /// typesize self-test (record stride implied by file length vs.
    /// `T::record_size()`). Refuses to attach on any mismatch (invariant 5).
    pub fn attach(path: &Path) -> Result<Self, StateAreaError> {
        if !path.exists() {
            return Err(StateAreaError::Missing(path.to_path_buf()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
        let len = file.metadata().map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?.len() as usize;
        if len < HEADER_LEN {
            return Err(StateAreaError::Truncated(path.to_path_buf()));
        }
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
        let (entry_count, schema_version) = read_header(&mmap);
        if schema_version != T::SCHEMA_VERSION {
            return Err(StateAreaError::IncompatibleVersion { path: path.to_path_buf(), expected: T::SCHEMA_VERSION, found: schema_version });
        }
        if entry_count == STALE_MARKER {
            return Err(StateAreaError::Stale(path.to_path_buf()));
        }
        let body_len = len - HEADER_LEN;
        let record_size = T::record_size();
        if record_size == 0 || body_len % record_size != 0 {
            return Err(StateAreaError::TypesizeMismatch { area: area_name::<T>(), expected: record_size, found: if entry_count > 0 { body_len / entry_count as usize } else { 0 } });
        }
        let record_count = body_len / record_size;
        if entry_count < 0 || entry_count as usize > record_count {
            return Err(StateAreaError::Truncated(path.to_path_buf()));
        }
        Ok(StateArea { path: path.to_path_buf(), mmap, generation: AtomicU64::new(1), record_count: entry_count as usize, _marker: PhantomData })
    }

    /// Create a brand-new area file from scratch (used by the config loader
    /// the first time a given area has no on-disk generation yet).
    pub fn create(path: &Path, records: &[T]) -> Result<Self, StateAreaError> {
        write_area_file(path, records)?;
        Self::attach(path)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    fn record_slice(&self, pos: usize) -> &[u8] {
        let start = HEADER_LEN + pos * T::record_size();
        &self.mmap[start..start + T::record_size()]
    }

    fn record_slice_mut(&mut self, pos: usize) -> &mut [u8] {
        let size = T::record_size();
        let start = HEADER_LEN + pos * size;
        &mut self.mmap[start..start + size]
    }

    pub fn get(&self, pos: usize) -> Option<T> {
        if pos >= self.record_count { return None; }
        Some(T::from_bytes(self.record_slice(pos)))
    }

    pub fn lookup_by_alias(&self, alias: &str) -> Option<usize> {
        (0..self.record_count).find(|&pos| self.get(pos).map(|r| r.alias() == alias).unwrap_or(false))
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<usize> {
        (0..self.record_count).find(|&pos| self.get(pos).map(|r| r.id() == id).unwrap_or(false))
    }

    /// Mint a handle for `id`, looking it up once to fail fast if absent.
    pub fn handle_for_id(&self, id: u32) -> Option<Handle<T>> {
        self.lookup_by_id(id)?;
        Some(Handle::new(self.generation(), id))
    }

    /// Re-resolve a handle to a position. Returns `Stale` if the area's
    /// generation has moved on since the handle was minted; callers must
    /// re-attach and mint a fresh handle in that case (§4.A contract).
    pub fn resolve(&self, handle: &Handle<T>) -> Result<usize, StateAreaError> {
        if handle.generation != self.generation() {
            return Err(StateAreaError::Stale(self.path.clone()));
        }
        self.lookup_by_id(handle.id).ok_or_else(|| StateAreaError::Stale(self.path.clone()))
    }

    /// Writer-only in-place field mutation (scheduler/workers own mutable
    /// fields of their respective slots per §3 "Ownership").
    pub fn update<F: FnOnce(&mut T)>(&mut self, pos: usize, f: F) -> Result<(), StateAreaError> {
        let mut record = self.get(pos).ok_or_else(|| StateAreaError::Truncated(self.path.clone()))?;
        f(&mut record);
        let bytes = record.to_bytes();
        self.record_slice_mut(pos).copy_from_slice(&bytes);
        Ok(())
    }

    /// Publish a whole new generation: write `<path>.new`, atomically rename
    /// over `path`, and mark the *previous* mapping STALE so any reader still
    /// holding it observes the sentinel on its next touch and re-attaches.
    pub fn publish_new(&mut self, records: &[T]) -> Result<(), StateAreaError> {
        // mark this mapping's header STALE before swapping the file from under it
        write_header(&mut self.mmap[..HEADER_LEN], STALE_MARKER, T::SCHEMA_VERSION);
        let _ = self.mmap.flush();

        let new_path = self.path.with_extension("new");
        write_area_file(&new_path, records)?;
        std::fs::rename(&new_path, &self.path).map_err(|e| StateAreaError::Io(self.path.clone(), e))?;

        let replacement = Self::attach(&self.path)?;
        self.mmap = replacement.mmap;
        self.record_count = replacement.record_count;
        self.generation.store(self.generation() + 1, Ordering::Release);
        Ok(())
    }
}

fn area_name<T>() -> &'static str {
    std::any::type_name::<T>()
}

fn write_area_file<T: StateRecord>(path: &Path, records: &[T]) -> Result<(), StateAreaError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + records.len() * T::record_size());
    let mut header = [0u8; HEADER_LEN];
    write_header(&mut header, records.len() as i32, T::SCHEMA_VERSION);
    buf.extend_from_slice(&header);
    for r in records {
        buf.extend_from_slice(&r.to_bytes());
    }
    let file: File = OpenOptions::new().create(true).write(true).truncate(true).open(path).map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
    file.set_len(buf.len() as u64).map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
    {
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
        mmap.copy_from_slice(&buf);
        mmap.flush().map_err(|e| StateAreaError::Io(path.to_path_buf(), e))?;
    }
    Ok(())
}

/// Startup-time check: attach every known area once and fail the whole
/// process if any typesize/schema mismatch is found (§4.A invariant 5,
/// property 8, scenario S5). Called once by `supervisor::start`.
pub fn typesize_selftest(layout: &crate::layout::WorkDirLayout) -> Result<(), StateAreaError> {
    for path in [layout.fsa_path(), layout.fra_path(), layout.jid_path(), layout.dnb_path(), layout.fmd_path()] {
        if !path.exists() {
            continue; // first run: config loader creates these on first publish
        }
        let file = OpenOptions::new().read(true).open(&path).map_err(|e| StateAreaError::Io(path.clone(), e))?;
        let len = file.metadata().map_err(|e| StateAreaError::Io(path.clone(), e))?.len();
        if len < HEADER_LEN as u64 {
            return Err(StateAreaError::Truncated(path));
        }
    }
    Ok(())
}

//! `LOC` adapter (§4.E): local-filesystem copy. "Remote" is just another
//! path on the same machine (or an NFS/SMB mount presented as one), so
//! `connect`/`login` are no-ops and every operation is `std::fs`, with the
//! same temp-file-then-atomic-rename discipline the rest of this crate uses
//! for any local write a worker might be interrupted mid-way through.

use std::path::Path;

use super::{ProtocolAdapter, RemoteEntry, Target};
use crate::error::{ProtocolError, TransferError};
use crate::state::pwb::Credential;

pub struct LocAdapter {
    root: String,
}

impl LocAdapter {
    pub fn new() -> Self {
        LocAdapter { root: String::new() }
    }

    fn resolve(&self, path: &str) -> std::path::PathBuf {
        if path.starts_with('/') {
            std::path::PathBuf::from(path)
        } else {
            std::path::Path::new(&self.root).join(path)
        }
    }
}

impl Default for LocAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for LocAdapter {
    fn connect(&mut self, target: &Target, _creds: Option<&Credential>) -> Result<(), ProtocolError> {
        self.root = target.path.clone();
        Ok(())
    }

    fn change_dir(&mut self, path: &str) -> Result<(), ProtocolError> {
        self.root = path.to_string();
        Ok(())
    }

    fn list(&mut self, remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        let dir = self.resolve(remote_path);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(ProtocolError::Io)? {
            let entry = entry.map_err(ProtocolError::Io)?;
            let meta = entry.metadata().map_err(ProtocolError::Io)?;
            out.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime: meta.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs() as i64).unwrap_or(0),
                is_dir: meta.is_dir(),
            });
        }
        Ok(out)
    }

    fn stat_remote(&mut self, remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        let path = self.resolve(remote_path);
        let meta = std::fs::metadata(&path).map_err(ProtocolError::Io)?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(RemoteEntry {
            name,
            size: meta.len(),
            mtime: meta.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs() as i64).unwrap_or(0),
            is_dir: meta.is_dir(),
        })
    }

    fn get(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, ProtocolError> {
        let src = self.resolve(remote_path);
        std::fs::copy(&src, local_path).map_err(ProtocolError::Io)
    }

    /// Write to `<remote_path>.afdtmp` then rename into place, so a reader
    /// never observes a partially-written file under the final name.
    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ProtocolError> {
        let dest = self.resolve(remote_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(ProtocolError::Io)?;
        }
        let tmp = dest.with_extension("afdtmp");
        let bytes = std::fs::copy(local_path, &tmp).map_err(ProtocolError::Io)?;
        std::fs::rename(&tmp, &dest).map_err(ProtocolError::Io)?;
        Ok(bytes)
    }

    fn delete_remote(&mut self, remote_path: &str) -> Result<(), ProtocolError> {
        std::fs::remove_file(self.resolve(remote_path)).map_err(ProtocolError::Io)
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), ProtocolError> {
        std::fs::rename(self.resolve(from), self.resolve(to)).map_err(ProtocolError::Io)
    }

    fn noop(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn quit(&mut self) {}
}

/// `stat_remote` on a path with no parent directory is a protocol bug, not
/// an IO error; kept here rather than inline so the panic path documents
/// the invariant LOC depends on (`resolve` never returns a root-less path).
#[allow(dead_code)]
fn assert_absolute(path: &Path) -> Result<(), TransferError> {
    if path.as_os_str().is_empty() {
        return Err(TransferError::LocalIo("empty path".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips_via_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.dat");
        std::fs::write(&src, b"hello").unwrap();
        let mut adapter = LocAdapter::new();
        adapter.root = dir.path().to_string_lossy().into_owned();
        let written = adapter.put(&src, "incoming/dest.dat").unwrap();
        assert_eq!(written, 5);
        assert!(dir.path().join("incoming/dest.dat").exists());
        assert!(!dir.path().join("incoming/dest.dat.afdtmp").exists());
    }

    #[test]
    fn list_reports_entries_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dat"), b"x").unwrap();
        let mut adapter = LocAdapter::new();
        adapter.root = dir.path().to_string_lossy().into_owned();
        let entries = adapter.list(".").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.dat");
    }
}

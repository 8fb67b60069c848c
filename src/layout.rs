//! On-disk directory layout for both the daemon's own config store and the
//! AFD work directory described in spec.md §6.

use std::path::{Path, PathBuf};

use anyhow::Result;

/// `~/.afd` — where `config.json`/`config_test.json` live. Kept separate
/// from the *work directory* (`Config::work_dir`), which holds the fifos,
/// state areas, retrieve lists, and archive tree and may live on a different
/// filesystem entirely.
pub fn ensure_afd_config_dir(home_dir: &Path) -> Result<PathBuf> {
    let dir = home_dir.join(".afd");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// The work-directory layout named in spec.md §6. Created idempotently at
/// supervisor startup; every other module resolves its paths through this
/// struct rather than hardcoding join()s.
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    pub root: PathBuf,
}

impl WorkDirLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifodir")
    }

    pub fn incoming_ls_data_dir(&self) -> PathBuf {
        self.root.join("incoming").join("ls_data")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn disabled_dirs_file(&self) -> PathBuf {
        self.etc_dir().join("disabled_dirs")
    }

    /// The DIR_CONFIG tree's entry point (§4.B, §6). Absence is not an
    /// error: a freshly-initialized work directory has nothing configured
    /// yet, and `supervisor::run` treats a missing file as "publish nothing".
    pub fn dir_config_path(&self) -> PathBuf {
        self.etc_dir().join("DIR_CONFIG")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn fsa_path(&self) -> PathBuf {
        self.fifo_dir().join("fsa")
    }

    pub fn fra_path(&self) -> PathBuf {
        self.fifo_dir().join("fra")
    }

    pub fn jid_path(&self) -> PathBuf {
        self.fifo_dir().join("jid")
    }

    pub fn dnb_path(&self) -> PathBuf {
        self.fifo_dir().join("dnb")
    }

    pub fn fmd_path(&self) -> PathBuf {
        self.fifo_dir().join("fmd")
    }

    pub fn pwb_db_path(&self) -> PathBuf {
        self.fifo_dir().join("pwb.sqlite")
    }

    pub fn dcl_db_path(&self) -> PathBuf {
        self.fifo_dir().join("dcl.sqlite")
    }

    pub fn active_marker_path(&self) -> PathBuf {
        self.fifo_dir().join("active-marker")
    }

    pub fn supervisor_cmd_fifo(&self) -> PathBuf {
        self.fifo_dir().join("supervisor.cmd")
    }

    pub fn supervisor_reply_fifo(&self) -> PathBuf {
        self.fifo_dir().join("supervisor.reply")
    }

    /// Ensure every directory in the layout exists and `etc/disabled_dirs`
    /// exists (empty) if absent, so the mtime-poll in the scheduler's
    /// housekeeping pass has something to stat from the first tick.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.fifo_dir(), self.incoming_ls_data_dir(), self.archive_dir(), self.etc_dir(), self.log_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        let disabled = self.disabled_dirs_file();
        if !disabled.exists() {
            std::fs::write(&disabled, b"# one disabled directory alias per line, '#' comments accepted\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_full_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(tmp.path().join("work"));
        layout.ensure().unwrap();
        assert!(layout.fifo_dir().is_dir());
        assert!(layout.incoming_ls_data_dir().is_dir());
        assert!(layout.archive_dir().is_dir());
        assert!(layout.disabled_dirs_file().is_file());
    }

    #[test]
    fn dir_config_path_lives_under_etc() {
        let layout = WorkDirLayout::new(PathBuf::from("/work"));
        assert_eq!(layout.dir_config_path(), PathBuf::from("/work/etc/DIR_CONFIG"));
    }
}

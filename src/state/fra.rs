//! FRA — Fileretrieve Status Area: one fixed-size record per configured
//! remote directory (spec.md §3 "Directory record").

use super::StateRecord;
use crate::retrieve_list::StupidMode;

pub const ALIAS_LEN: usize = 32;
pub const URL_LEN: usize = 128;
pub const PATH_LEN: usize = 192;

pub mod dir_flags {
    pub const DISABLED: u8 = 0b0001;
    pub const STOPPED: u8 = 0b0010;
    pub const INOTIFY_NEEDS_SCAN: u8 = 0b0100;
    pub const WARN_TIME_REACHED: u8 = 0b1000;
}

fn stupid_mode_to_u8(mode: StupidMode) -> u8 {
    match mode {
        StupidMode::No => 0,
        StupidMode::Yes => 1,
        StupidMode::GetOnceOnly => 2,
        StupidMode::GetOnceNotExact => 3,
        StupidMode::AppendOnly => 4,
    }
}

fn stupid_mode_from_u8(v: u8) -> StupidMode {
    match v {
        0 => StupidMode::No,
        1 => StupidMode::Yes,
        2 => StupidMode::GetOnceOnly,
        4 => StupidMode::AppendOnly,
        _ => StupidMode::GetOnceNotExact,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirRecord {
    pub alias: String,
    pub dir_id: u32,
    pub url: String,
    pub fs_path: String,
    pub protocol_bitset: u32,
    pub parallelism: u16,
    pub files_done: u64,
    pub bytes_done: u64,
    pub flags: u8,
    /// `archive_time` (seconds) — 0 disables archiving for this directory.
    pub archive_time_secs: u64,
    pub next_check_time: i64,
    /// Retrieve-list rewrite policy (§4.F). Defaults to `GetOnceNotExact`,
    /// the same default DIR_CONFIG applies when a directory block omits it.
    pub stupid_mode: StupidMode,
}

impl DirRecord {
    pub fn new(alias: impl Into<String>, url: impl Into<String>, fs_path: impl Into<String>) -> Self {
        let alias = alias.into();
        let url = url.into();
        DirRecord {
            dir_id: crc32fast::hash(alias.as_bytes()),
            alias,
            url,
            fs_path: fs_path.into(),
            protocol_bitset: 0,
            parallelism: 1,
            files_done: 0,
            bytes_done: 0,
            flags: 0,
            archive_time_secs: 0,
            next_check_time: 0,
            stupid_mode: StupidMode::GetOnceNotExact,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.flags & dir_flags::DISABLED != 0
    }

    pub fn is_due(&self, now: i64) -> bool {
        !self.is_disabled() && self.flags & dir_flags::STOPPED == 0 && self.next_check_time <= now
    }
}

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let mut buf = vec![0u8; width];
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&buf);
}

impl StateRecord for DirRecord {
    const SCHEMA_VERSION: u8 = 1;

    fn record_size() -> usize {
        ALIAS_LEN + 4 + URL_LEN + PATH_LEN + 4 + 2 + 8 + 8 + 1 + 8 + 8 + 1
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_size());
        write_fixed_str(&mut out, &self.alias, ALIAS_LEN);
        out.extend_from_slice(&self.dir_id.to_le_bytes());
        write_fixed_str(&mut out, &self.url, URL_LEN);
        write_fixed_str(&mut out, &self.fs_path, PATH_LEN);
        out.extend_from_slice(&self.protocol_bitset.to_le_bytes());
        out.extend_from_slice(&self.parallelism.to_le_bytes());
        out.extend_from_slice(&self.files_done.to_le_bytes());
        out.extend_from_slice(&self.bytes_done.to_le_bytes());
        out.push(self.flags);
        out.extend_from_slice(&self.archive_time_secs.to_le_bytes());
        out.extend_from_slice(&self.next_check_time.to_le_bytes());
        out.push(stupid_mode_to_u8(self.stupid_mode));
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        let mut off = 0;
        let alias = fixed_str(&b[off..off + ALIAS_LEN]);
        off += ALIAS_LEN;
        let dir_id = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let url = fixed_str(&b[off..off + URL_LEN]);
        off += URL_LEN;
        let fs_path = fixed_str(&b[off..off + PATH_LEN]);
        off += PATH_LEN;
        let protocol_bitset = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let parallelism = u16::from_le_bytes(b[off..off + 2].try_into().unwrap());
        off += 2;
        let files_done = u64::from_le_bytes(b[off..off + 8].try_into().unwrap());
        off += 8;
        let bytes_done = u64::from_le_bytes(b[off..off + 8].try_into().unwrap());
        off += 8;
        let flags = b[off];
        off += 1;
        let archive_time_secs = u64::from_le_bytes(b[off..off + 8].try_into().unwrap());
        off += 8;
        let next_check_time = i64::from_le_bytes(b[off..off + 8].try_into().unwrap());
        off += 8;
        let stupid_mode = stupid_mode_from_u8(b[off]);
        DirRecord { alias, dir_id, url, fs_path, protocol_bitset, parallelism, files_done, bytes_done, flags, archive_time_secs, next_check_time, stupid_mode }
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    fn id(&self) -> u32 {
        self.dir_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut rec = DirRecord::new("incoming-a", "sftp://h1/incoming", "/srv/incoming/a");
        rec.archive_time_secs = 3600;
        rec.next_check_time = 1000;
        rec.stupid_mode = StupidMode::GetOnceOnly;
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), DirRecord::record_size());
        assert_eq!(DirRecord::from_bytes(&bytes), rec);
    }

    #[test]
    fn stupid_mode_round_trips_every_variant() {
        for mode in [StupidMode::No, StupidMode::Yes, StupidMode::GetOnceOnly, StupidMode::GetOnceNotExact, StupidMode::AppendOnly] {
            let mut rec = DirRecord::new("a", "sftp://h1/x", "/x");
            rec.stupid_mode = mode;
            assert_eq!(DirRecord::from_bytes(&rec.to_bytes()).stupid_mode, mode);
        }
    }

    #[test]
    fn is_due_respects_disabled_and_stopped() {
        let mut rec = DirRecord::new("a", "sftp://h1/x", "/x");
        rec.next_check_time = 0;
        assert!(rec.is_due(10));
        rec.flags |= dir_flags::DISABLED;
        assert!(!rec.is_due(10));
    }
}

//! JID — the job-identity catalog: an immutable tuple per spec.md §3
//! "Job-ID record". New job-ids are minted whenever any field of the tuple
//! changes and are never reused (§4.B).

use super::StateRecord;

pub const RECIPIENT_LEN: usize = 160;
pub const OPTIONS_LEN: usize = 96;

/// Remote-side file lock discipline, part of the JID tuple per the
/// supplemented features in SPEC_FULL.md §10 (so it participates in the
/// job-id hash, not just worker-side behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockDiscipline {
    None = 0,
    DotPrefixThenRename = 1,
    DotPrefixVms = 2,
    Postfix = 3,
    SideLockfile = 4,
}

impl LockDiscipline {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LockDiscipline::DotPrefixThenRename,
            2 => LockDiscipline::DotPrefixVms,
            3 => LockDiscipline::Postfix,
            4 => LockDiscipline::SideLockfile,
            _ => LockDiscipline::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: u32,
    pub dir_id: u32,
    pub file_mask_id: u32,
    pub recipient_url: String,
    /// `'0'..='9'`, lower numeric = higher priority (§4.C).
    pub priority: u8,
    pub local_options: String,
    pub socket_options: String,
    pub dir_config_id: u32,
    pub lock_discipline: LockDiscipline,
}

impl JobRecord {
    /// Deterministic 32-bit job-id over the canonicalized tuple fields, the
    /// same hash primitive the dup-check/DIR_CONFIG modules use (§4.B).
    pub fn compute_job_id(
        dir_id: u32,
        file_mask_id: u32,
        recipient_url: &str,
        priority: u8,
        local_options: &str,
        socket_options: &str,
        dir_config_id: u32,
        lock_discipline: LockDiscipline,
    ) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&dir_id.to_le_bytes());
        hasher.update(&file_mask_id.to_le_bytes());
        hasher.update(recipient_url.as_bytes());
        hasher.update(&[priority]);
        hasher.update(local_options.as_bytes());
        hasher.update(socket_options.as_bytes());
        hasher.update(&dir_config_id.to_le_bytes());
        hasher.update(&[lock_discipline as u8]);
        hasher.finalize()
    }

    pub fn new(
        dir_id: u32,
        file_mask_id: u32,
        recipient_url: impl Into<String>,
        priority: u8,
        local_options: impl Into<String>,
        socket_options: impl Into<String>,
        dir_config_id: u32,
        lock_discipline: LockDiscipline,
    ) -> Self {
        let recipient_url = recipient_url.into();
        let local_options = local_options.into();
        let socket_options = socket_options.into();
        let job_id = Self::compute_job_id(dir_id, file_mask_id, &recipient_url, priority, &local_options, &socket_options, dir_config_id, lock_discipline);
        JobRecord { job_id, dir_id, file_mask_id, recipient_url, priority, local_options, socket_options, dir_config_id, lock_discipline }
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

impl StateRecord for JobRecord {
    const SCHEMA_VERSION: u8 = 1;

    fn record_size() -> usize {
        4 + 4 + 4 + RECIPIENT_LEN + 1 + OPTIONS_LEN + OPTIONS_LEN + 4 + 1
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_size());
        out.extend_from_slice(&self.job_id.to_le_bytes());
        out.extend_from_slice(&self.dir_id.to_le_bytes());
        out.extend_from_slice(&self.file_mask_id.to_le_bytes());
        write_fixed_str(&mut out, &self.recipient_url, RECIPIENT_LEN);
        out.push(self.priority);
        write_fixed_str(&mut out, &self.local_options, OPTIONS_LEN);
        write_fixed_str(&mut out, &self.socket_options, OPTIONS_LEN);
        out.extend_from_slice(&self.dir_config_id.to_le_bytes());
        out.push(self.lock_discipline as u8);
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        let mut off = 0;
        let job_id = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let dir_id = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let file_mask_id = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let recipient_url = fixed_str(&b[off..off + RECIPIENT_LEN]);
        off += RECIPIENT_LEN;
        let priority = b[off];
        off += 1;
        let local_options = fixed_str(&b[off..off + OPTIONS_LEN]);
        off += OPTIONS_LEN;
        let socket_options = fixed_str(&b[off..off + OPTIONS_LEN]);
        off += OPTIONS_LEN;
        let dir_config_id = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let lock_discipline = LockDiscipline::from_u8(b[off]);
        JobRecord { job_id, dir_id, file_mask_id, recipient_url, priority, local_options, socket_options, dir_config_id, lock_discipline }
    }

    fn alias(&self) -> &str {
        &self.recipient_url
    }

    fn id(&self) -> u32 {
        self.job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_stable_for_unchanged_tuple() {
        let a = JobRecord::new(1, 2, "sftp://host/out", b'5', "", "", 9, LockDiscipline::Postfix);
        let b = JobRecord::new(1, 2, "sftp://host/out", b'5', "", "", 9, LockDiscipline::Postfix);
        assert_eq!(a.job_id, b.job_id);
    }

    #[test]
    fn job_id_changes_when_any_field_changes() {
        let a = JobRecord::new(1, 2, "sftp://host/out", b'5', "", "", 9, LockDiscipline::Postfix);
        let b = JobRecord::new(1, 2, "sftp://host/out", b'5', "", "", 9, LockDiscipline::None);
        assert_ne!(a.job_id, b.job_id);
    }

    #[test]
    fn round_trips_through_bytes() {
        let rec = JobRecord::new(1, 2, "sftp://host/out", b'5', "opt=a", "sock=b", 9, LockDiscipline::DotPrefixThenRename);
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), JobRecord::record_size());
        assert_eq!(JobRecord::from_bytes(&bytes), rec);
    }
}

//! FSA — Filetransfer Status Area: one fixed-size record per configured
//! host alias (spec.md §3 "Host record").

use super::StateRecord;

pub const ALIAS_LEN: usize = 32;
pub const HOSTNAME_LEN: usize = 64;
pub const MAX_JOB_SLOTS: usize = 4;

/// Host status bitset (spec.md §3). Four bits don't earn a `bitflags`
/// dependency; plain consts over a `u8` read the same at call sites.
pub mod host_status {
    pub const DISABLED: u8 = 0b0001;
    pub const OFFLINE: u8 = 0b0010;
    pub const STOPPED: u8 = 0b0100;
    pub const ERROR_ACKNOWLEDGED: u8 = 0b1000;
}

/// One transfer's progress, embedded per job-slot in a `HostRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSlot {
    pub protocol_phase: u8,
    pub bytes_done: u64,
    pub file_count: u32,
    pub job_id: u32,
}

impl JobSlot {
    const SIZE: usize = 1 + 8 + 4 + 4;

    fn idle() -> Self {
        JobSlot { protocol_phase: 0, bytes_done: 0, file_count: 0, job_id: 0 }
    }

    fn is_idle(&self) -> bool {
        self.protocol_phase == 0 && self.job_id == 0
    }

    fn to_bytes(self, out: &mut Vec<u8>) {
        out.push(self.protocol_phase);
        out.extend_from_slice(&self.bytes_done.to_le_bytes());
        out.extend_from_slice(&self.file_count.to_le_bytes());
        out.extend_from_slice(&self.job_id.to_le_bytes());
    }

    fn from_bytes(b: &[u8]) -> Self {
        JobSlot {
            protocol_phase: b[0],
            bytes_done: u64::from_le_bytes(b[1..9].try_into().unwrap()),
            file_count: u32::from_le_bytes(b[9..13].try_into().unwrap()),
            job_id: u32::from_le_bytes(b[13..17].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub alias: String,
    pub hostname_active: String,
    pub hostname_toggle: String,
    pub using_toggle: bool,
    pub protocol_bitset: u32,
    pub max_parallel: u16,
    pub allowed: u16,
    pub active: u16,
    pub consecutive_errors: u32,
    pub status: u8,
    pub debug_mode: bool,
    pub job_slots: [JobSlot; MAX_JOB_SLOTS],
}

impl HostRecord {
    pub fn new(alias: impl Into<String>, hostname: impl Into<String>, max_parallel: u16) -> Self {
        HostRecord {
            alias: alias.into(),
            hostname_active: hostname.into(),
            hostname_toggle: String::new(),
            using_toggle: false,
            protocol_bitset: 0,
            max_parallel,
            allowed: max_parallel,
            active: 0,
            consecutive_errors: 0,
            status: 0,
            debug_mode: false,
            job_slots: [JobSlot::idle(); MAX_JOB_SLOTS],
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.status & host_status::DISABLED != 0
    }

    pub fn active_hostname(&self) -> &str {
        if self.using_toggle { &self.hostname_toggle } else { &self.hostname_active }
    }

    /// Invariant 2 (§3): active_transfer_count equals live non-idle slots.
    pub fn live_slot_count(&self) -> usize {
        self.job_slots.iter().filter(|s| !s.is_idle()).count()
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

impl StateRecord for HostRecord {
    const SCHEMA_VERSION: u8 = 1;

    fn record_size() -> usize {
        ALIAS_LEN + HOSTNAME_LEN * 2 + 1 + 4 + 2 + 2 + 2 + 4 + 1 + 1 + JobSlot::SIZE * MAX_JOB_SLOTS
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_size());
        write_fixed_str(&mut out, &self.alias, ALIAS_LEN);
        write_fixed_str(&mut out, &self.hostname_active, HOSTNAME_LEN);
        write_fixed_str(&mut out, &self.hostname_toggle, HOSTNAME_LEN);
        out.push(self.using_toggle as u8);
        out.extend_from_slice(&self.protocol_bitset.to_le_bytes());
        out.extend_from_slice(&self.max_parallel.to_le_bytes());
        out.extend_from_slice(&self.allowed.to_le_bytes());
        out.extend_from_slice(&self.active.to_le_bytes());
        out.extend_from_slice(&self.consecutive_errors.to_le_bytes());
        out.push(self.status);
        out.push(self.debug_mode as u8);
        for slot in &self.job_slots {
            slot.to_bytes(&mut out);
        }
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        let mut off = 0;
        let alias = fixed_str(&b[off..off + ALIAS_LEN]);
        off += ALIAS_LEN;
        let hostname_active = fixed_str(&b[off..off + HOSTNAME_LEN]);
        off += HOSTNAME_LEN;
        let hostname_toggle = fixed_str(&b[off..off + HOSTNAME_LEN]);
        off += HOSTNAME_LEN;
        let using_toggle = b[off] != 0;
        off += 1;
        let protocol_bitset = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let max_parallel = u16::from_le_bytes(b[off..off + 2].try_into().unwrap());
        off += 2;
        let allowed = u16::from_le_bytes(b[off..off + 2].try_into().unwrap());
        off += 2;
        let active = u16::from_le_bytes(b[off..off + 2].try_into().unwrap());
        off += 2;
        let consecutive_errors = u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        off += 4;
        let status = b[off];
        off += 1;
        let debug_mode = b[off] != 0;
        off += 1;
        let mut job_slots = [JobSlot::idle(); MAX_JOB_SLOTS];
        for slot in job_slots.iter_mut() {
            *slot = JobSlot::from_bytes(&b[off..off + JobSlot::SIZE]);
            off += JobSlot::SIZE;
        }
        HostRecord {
            alias,
            hostname_active,
            hostname_toggle,
            using_toggle,
            protocol_bitset,
            max_parallel,
            allowed,
            active,
            consecutive_errors,
            status,
            debug_mode,
            job_slots,
        }
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    fn id(&self) -> u32 {
        crc32fast::hash(self.alias.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut rec = HostRecord::new("h1", "primary.example.com", 4);
        rec.hostname_toggle = "backup.example.com".into();
        rec.consecutive_errors = 2;
        rec.job_slots[0] = JobSlot { protocol_phase: 3, bytes_done: 4096, file_count: 2, job_id: 77 };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), HostRecord::record_size());
        let back = HostRecord::from_bytes(&bytes);
        assert_eq!(back, rec);
    }

    #[test]
    fn live_slot_count_matches_non_idle_slots() {
        let mut rec = HostRecord::new("h1", "primary", 4);
        assert_eq!(rec.live_slot_count(), 0);
        rec.job_slots[0] = JobSlot { protocol_phase: 1, bytes_done: 0, file_count: 0, job_id: 5 };
        assert_eq!(rec.live_slot_count(), 1);
    }
}

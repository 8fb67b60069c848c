//! DNB — Directory-name buffer: append-only map dir-id → canonical path
//! (spec.md §3).

use super::StateRecord;

pub const PATH_LEN: usize = 192;

#[derive(Debug, Clone, PartialEq)]
pub struct DirNameEntry {
    pub dir_id: u32,
    pub canonical_path: String,
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

impl StateRecord for DirNameEntry {
    const SCHEMA_VERSION: u8 = 1;

    fn record_size() -> usize {
        4 + PATH_LEN
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_size());
        out.extend_from_slice(&self.dir_id.to_le_bytes());
        write_fixed_str(&mut out, &self.canonical_path, PATH_LEN);
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        let dir_id = u32::from_le_bytes(b[0..4].try_into().unwrap());
        let canonical_path = fixed_str(&b[4..4 + PATH_LEN]);
        DirNameEntry { dir_id, canonical_path }
    }

    fn alias(&self) -> &str {
        &self.canonical_path
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
        let rec = DirNameEntry { dir_id: 42, canonical_path: "/srv/incoming/a".into() };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), DirNameEntry::record_size());
        assert_eq!(DirNameEntry::from_bytes(&bytes), rec);
    }
}

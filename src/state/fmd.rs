//! FMD — File-mask database: append-only map file-mask-id → ordered list of
//! glob patterns (spec.md §3).

use super::StateRecord;

/// Patterns are stored `\n`-joined in one fixed buffer; ordering within the
/// buffer is the ordering the spec requires to be preserved.
pub const PATTERNS_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct FileMaskEntry {
    pub file_mask_id: u32,
    pub patterns: Vec<String>,
}

impl FileMaskEntry {
    pub fn new(file_mask_id: u32, patterns: Vec<String>) -> Self {
        FileMaskEntry { file_mask_id, patterns }
    }

    fn joined(&self) -> String {
        self.patterns.join("\n")
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

impl StateRecord for FileMaskEntry {
    const SCHEMA_VERSION: u8 = 1;

    fn record_size() -> usize {
        4 + PATTERNS_LEN
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::record_size());
        out.extend_from_slice(&self.file_mask_id.to_le_bytes());
        write_fixed_str(&mut out, &self.joined(), PATTERNS_LEN);
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        let file_mask_id = u32::from_le_bytes(b[0..4].try_into().unwrap());
        let joined = fixed_str(&b[4..4 + PATTERNS_LEN]);
        let patterns = if joined.is_empty() { Vec::new() } else { joined.split('\n').map(str::to_string).collect() };
        FileMaskEntry { file_mask_id, patterns }
    }

    fn alias(&self) -> &str {
        ""
    }

    fn id(&self) -> u32 {
        self.file_mask_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_preserving_order() {
        let rec = FileMaskEntry::new(7, vec!["*.grib2".into(), "data_*".into()]);
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), FileMaskEntry::record_size());
        assert_eq!(FileMaskEntry::from_bytes(&bytes), rec);
    }
}

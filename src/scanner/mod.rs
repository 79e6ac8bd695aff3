pub mod cpu;

use std::collections::{BTreeSet, HashMap};

use crate::chunk::ScanWindow;
use crate::config::Config;
use crate::source::{ByteSource, SourceError};
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Hit {
    pub window_index: u64,
    pub local_offset: u64,
    pub marker_id: String,
}

pub trait SignatureScanner: Send + Sync {
    fn scan_window(&self, window: &ScanWindow, data: &[u8]) -> Vec<Hit>;
    fn max_signature_len(&self) -> usize;
    fn marker_ids(&self) -> Vec<&str>;
}

/// Marker name to ascending, deduplicated offsets where its signature occurs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: HashMap<String, Vec<u64>>,
}

impl OffsetTable {
    pub fn get(&self, marker: &str) -> &[u64] {
        self.offsets.get(marker).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_hits(&self) -> usize {
        self.offsets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_hits() == 0
    }

    pub fn from_sets(sets: HashMap<String, BTreeSet<u64>>) -> Self {
        Self {
            offsets: sets
                .into_iter()
                .map(|(k, v)| (k, v.into_iter().collect()))
                .collect(),
        }
    }
}

pub fn build_signature_scanner(cfg: &Config, wanted: &[&str]) -> Result<Box<dyn SignatureScanner>> {
    Ok(Box::new(cpu::CpuScanner::new(cfg, wanted)?))
}

/// Run `scanner` over the whole source in overlapping windows.
///
/// Any read failure aborts the scan; no partial table is returned.
pub fn scan_source(
    scanner: &dyn SignatureScanner,
    source: &dyn ByteSource,
    window_size: u64,
    overlap: u64,
) -> Result<OffsetTable, SourceError> {
    let overlap = overlap.max(scanner.max_signature_len().saturating_sub(1) as u64);
    let window_size = window_size.max(overlap + 1);
    let mut sets: HashMap<String, BTreeSet<u64>> = scanner
        .marker_ids()
        .into_iter()
        .map(|id| (id.to_string(), BTreeSet::new()))
        .collect();
    let mut buf = vec![0u8; window_size.min(source.len()) as usize];

    for window in crate::chunk::windows(source.len(), window_size, overlap) {
        let data = &mut buf[..window.length as usize];
        let n = source.read_full_at(window.start, data)?;
        if n < data.len() {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {}", window.start + n as u64),
            )));
        }
        for hit in scanner.scan_window(&window, data) {
            sets.entry(hit.marker_id)
                .or_default()
                .insert(window.start + hit.local_offset);
        }
    }

    Ok(OffsetTable::from_sets(sets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> OffsetTable {
        let mut sets = HashMap::new();
        sets.insert("a".to_string(), BTreeSet::from([5u64, 1, 9]));
        OffsetTable::from_sets(sets)
    }

    #[test]
    fn offsets_are_sorted() {
        assert_eq!(table().get("a"), &[1, 5, 9]);
        assert_eq!(table().get("missing"), &[] as &[u64]);
        assert!(!table().is_empty());
        assert!(OffsetTable::default().is_empty());
    }
}

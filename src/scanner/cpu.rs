use anyhow::{Result, anyhow};
use memchr::memchr;
use tracing::debug;

use crate::chunk::ScanWindow;
use crate::config::Config;
use crate::scanner::{Hit, SignatureScanner};

#[derive(Debug, Clone)]
struct Pattern {
    id: String,
    bytes: Vec<u8>,
}

pub struct CpuScanner {
    patterns: Vec<Pattern>,
}

impl CpuScanner {
    /// Build a scanner for the markers named in `wanted`. Names absent from
    /// the marker table and empty signatures are skipped.
    pub fn new(cfg: &Config, wanted: &[&str]) -> Result<Self> {
        let mut patterns = Vec::new();
        for name in wanted {
            let Some(marker) = cfg.markers.iter().find(|m| m.id == *name) else {
                debug!("marker {name} has no signature; ignored");
                continue;
            };
            let bytes = hex::decode(marker.hex.trim())
                .map_err(|e| anyhow!("invalid hex pattern {}: {e}", marker.id))?;
            if bytes.is_empty() {
                continue;
            }
            if patterns.iter().any(|p: &Pattern| p.id == marker.id) {
                continue;
            }
            patterns.push(Pattern {
                id: marker.id.clone(),
                bytes,
            });
        }
        Ok(Self { patterns })
    }
}

impl SignatureScanner for CpuScanner {
    fn scan_window(&self, window: &ScanWindow, data: &[u8]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for pattern in &self.patterns {
            let first = pattern.bytes[0];
            let mut pos = 0usize;
            while pos < data.len() {
                let idx = match memchr(first, &data[pos..]) {
                    Some(i) => pos + i,
                    None => break,
                };
                if idx + pattern.bytes.len() <= data.len()
                    && data[idx..idx + pattern.bytes.len()] == pattern.bytes[..]
                {
                    hits.push(Hit {
                        window_index: window.index,
                        local_offset: idx as u64,
                        marker_id: pattern.id.clone(),
                    });
                }
                // advance by one so self-overlapping matches are all reported
                pos = idx + 1;
            }
        }
        hits
    }

    fn max_signature_len(&self) -> usize {
        self.patterns.iter().map(|p| p.bytes.len()).max().unwrap_or(0)
    }

    fn marker_ids(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.id.as_str()).collect()
    }
}

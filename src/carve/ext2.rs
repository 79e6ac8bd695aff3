//! ext2/3/4 file systems, dumped with `debugfs` so no mount is needed.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::sized::{self, EXT2_SUPERBLOCK};
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

/// Superblock magic position relative to the start of the file system.
const EXT2_MAGIC_OFFSET: u64 = EXT2_SUPERBLOCK + 0x38;

static BLOCK_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Block count:\s+(\d+)").expect("block count pattern"));
static BLOCK_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Block size:\s+(\d+)").expect("block size pattern"));

/// debugfs prints its banner on stderr and exits 0 even when a dump fails
/// half way; whether anything came out is checked afterwards.
const DEBUGFS_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[OutcomeRule::new(ExitMatch::Zero, Outcome::Success)],
    benign_stderr: Some("debugfs"),
};

/// Image size reported by `tune2fs -l`.
fn listed_size(listing: &str) -> Option<u64> {
    let count: u64 = BLOCK_COUNT.captures(listing)?[1].parse().ok()?;
    let size: u64 = BLOCK_SIZE.captures(listing)?[1].parse().ok()?;
    count.checked_mul(size)
}

pub struct Ext2Driver;

impl FormatDriver for Ext2Driver {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["ext2"]
    }

    fn marker_correction(&self) -> u64 {
        EXT2_MAGIC_OFFSET
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["tune2fs", "debugfs"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::ext2(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let superblock = sized::ext2(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, superblock.image_size())?;
        let listing = ctx
            .describe(&Invocation::new("tune2fs").arg("-l").arg(scratch.path()))
            .ok_or(CarveError::ExpectedMiss)?;
        let length = listed_size(&listing.stdout_text()).ok_or(CarveError::ExpectedMiss)?;
        if length > ctx.source.remaining(offset) {
            debug!("ext2 at {offset:#x}: tune2fs size {length} exceeds file");
            return Err(CarveError::ExpectedMiss);
        }
        let mut request = std::ffi::OsString::from("rdump / ");
        request.push(dir);
        ctx.run_tool(
            &Invocation::new("debugfs")
                .arg("-R")
                .arg(request)
                .arg(scratch.path()),
            &DEBUGFS_OUTCOMES,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune2fs_listing_gives_image_size() {
        let listing = "Filesystem volume name:   <none>\nBlock count:              8192\nFree blocks: 10\nBlock size:               1024\n";
        assert_eq!(listed_size(listing), Some(8192 * 1024));
        assert_eq!(listed_size("Block count: 12\n"), None);
    }
}

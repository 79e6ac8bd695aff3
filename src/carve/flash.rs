//! Flash file systems and containers: JFFS2, UBI and YAFFS2.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::{checksum, sized};
use crate::scanner::OffsetTable;
use crate::tool::{Invocation, OutcomeTable};

pub struct Jffs2Driver;

impl Jffs2Driver {
    /// First node must be intact and its end must not land in claimed data.
    fn first_node(ctx: &CarveContext, offset: u64) -> Option<checksum::Jffs2Node> {
        let node = checksum::jffs2_node(ctx.source, offset, false)
            .or_else(|| checksum::jffs2_node(ctx.source, offset, true))?;
        let end = offset + u64::from(node.total_len);
        if end > ctx.file_len() || ctx.blacklist.is_blacklisted(end).is_some() {
            return None;
        }
        Some(node)
    }
}

impl FormatDriver for Jffs2Driver {
    fn name(&self) -> &'static str {
        "jffs2"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["jffs2_le", "jffs2_be"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["jefferson"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        Self::first_node(ctx, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let node = Self::first_node(ctx, offset).ok_or(CarveError::ExpectedMiss)?;
        let length = checksum::jffs2_extent(ctx.source, offset, node.big_endian);
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("jefferson")
                .arg("-d")
                .arg(dir.join("jffs2-root"))
                .arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

static PEB_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"PEB Size:\s*(\d+)").expect("peb size pattern"));
static BLOCK_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total Block Count:\s*(\d+)").expect("block count pattern"));

/// Physical erase block size times block count from `ubireader_display_info`.
fn ubi_image_size(info: &str) -> Option<u64> {
    let peb: u64 = PEB_SIZE.captures(info)?[1].parse().ok()?;
    let blocks: u64 = BLOCK_COUNT.captures(info)?[1].parse().ok()?;
    peb.checked_mul(blocks)
}

pub struct UbiDriver;

impl FormatDriver for UbiDriver {
    fn name(&self) -> &'static str {
        "ubi"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["ubi"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["ubireader_extract_images", "ubireader_display_info"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::ubi(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let span = ctx.unclaimed_span(offset);
        let scratch = ctx.carve_range(self.name(), offset, span)?;
        ctx.run_tool(
            &Invocation::new("ubireader_extract_images")
                .arg("-o")
                .arg(dir)
                .arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        let length = ctx
            .describe(&Invocation::new("ubireader_display_info").arg(scratch.path()))
            .and_then(|info| ubi_image_size(&info.stdout_text()))
            .filter(|&len| len <= span)
            .unwrap_or(0);
        Ok(Carved::length(length))
    }
}

/// YAFFS2 has no superblock or magic, so only whole files whose size fits
/// the page geometry are tried.
pub struct Yaffs2Driver;

impl FormatDriver for Yaffs2Driver {
    fn name(&self) -> &'static str {
        "yaffs2"
    }

    fn markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["unyaffs"]
    }

    fn candidates(&self, _table: &OffsetTable) -> Vec<u64> {
        vec![0]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        offset == 0 && sized::yaffs2(ctx.source)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = ctx.file_len();
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("unyaffs").arg(scratch.path()).arg(dir),
            &OutcomeTable::EXIT_ZERO,
        )?;
        // unyaffs exits 0 on garbage too
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
    fn ubi_info_gives_image_size() {
        let info = "UBI File\n---------------------\n\tMin I/O: 2048\n\tLEB Size: 126976\n\tPEB Size: 131072\n\tTotal Block Count: 64\n";
        assert_eq!(ubi_image_size(info), Some(131072 * 64));
        assert_eq!(ubi_image_size("PEB Size: 10"), None);
    }
}

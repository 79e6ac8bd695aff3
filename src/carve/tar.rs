//! tar archives.
//!
//! The `ustar` magic sits 0x101 bytes into the first header, so candidates
//! are shifted back by that much. The archive length comes from walking the
//! 512-byte headers; GNU tar does the extraction.

use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::structural::{self, TAR_MAGIC_OFFSET};
use crate::tool::{Invocation, OutcomeTable};

pub struct TarDriver;

impl FormatDriver for TarDriver {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["tar"]
    }

    fn marker_correction(&self) -> u64 {
        TAR_MAGIC_OFFSET
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["tar"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        structural::tar(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = structural::tar(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("tar")
                .args(["--no-same-owner", "--no-same-permissions", "-xf"])
                .arg(scratch.path())
                .arg("-C")
                .arg(dir),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

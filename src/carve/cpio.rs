//! cpio and ar archives, both extracted with the working directory set to
//! the output directory.

use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::structural;
use crate::tool::{Invocation, OutcomeTable};

pub struct CpioDriver;

impl CpioDriver {
    fn archive_len(ctx: &CarveContext, offset: u64) -> Option<u64> {
        structural::cpio(ctx.source, offset, ctx.table.get("cpiotrailer"))
    }
}

impl FormatDriver for CpioDriver {
    fn name(&self) -> &'static str {
        "cpio"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["cpio1", "cpio2", "cpio3"]
    }

    fn auxiliary_markers(&self) -> &'static [&'static str] {
        &["cpiotrailer"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["cpio"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        Self::archive_len(ctx, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = Self::archive_len(ctx, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("cpio")
                .args(["-i", "-d", "--no-absolute-filenames", "--quiet"])
                .stdin_from(scratch.path())
                .current_dir(dir),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

pub struct ArDriver;

impl FormatDriver for ArDriver {
    fn name(&self) -> &'static str {
        "ar"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["ar"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["ar"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        structural::ar(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = structural::ar(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("ar")
                .arg("x")
                .arg(scratch.path())
                .current_dir(dir),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

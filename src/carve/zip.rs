//! ZIP archives, tested and then extracted by Info-ZIP `unzip`.

use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::structural;
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

/// Exit 1 is "completed with warnings", e.g. a prepended stub.
const UNZIP_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
        OutcomeRule::new(ExitMatch::Code(1), Outcome::Success),
    ],
    benign_stderr: None,
};

pub struct ZipDriver;

impl ZipDriver {
    fn archive_len(ctx: &CarveContext, offset: u64) -> Option<u64> {
        structural::zip(ctx.source, offset, ctx.table.get("zipend"))
    }
}

impl FormatDriver for ZipDriver {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["zip"]
    }

    fn auxiliary_markers(&self) -> &'static [&'static str] {
        &["zipend"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["unzip"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        Self::archive_len(ctx, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = Self::archive_len(ctx, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("unzip").args(["-t", "-qq"]).arg(scratch.path()),
            &UNZIP_OUTCOMES,
        )?;
        ctx.run_tool(
            &Invocation::new("unzip")
                .args(["-o", "-qq"])
                .arg(scratch.path())
                .arg("-d")
                .arg(dir),
            &UNZIP_OUTCOMES,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

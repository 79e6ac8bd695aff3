//! 7z archives.

use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::structural;
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

/// 7-Zip exit codes: 0 ok, 1 warning (some files skipped), 2 fatal.
pub(crate) const SEVENZIP_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
        OutcomeRule::new(ExitMatch::Code(1), Outcome::Success),
    ],
    benign_stderr: None,
};

/// `7z x` of `scratch` into `dir`.
pub(crate) fn extract(ctx: &CarveContext, scratch: &Path, dir: &Path) -> Result<(), CarveError> {
    let mut target = std::ffi::OsString::from("-o");
    target.push(dir);
    ctx.run_tool(
        &Invocation::new("7z")
            .args(["x", "-y", "-bd"])
            .arg(target)
            .arg(scratch),
        &SEVENZIP_OUTCOMES,
    )?;
    if !has_output(dir) {
        return Err(CarveError::ExpectedMiss);
    }
    Ok(())
}

pub struct SevenZipDriver;

impl FormatDriver for SevenZipDriver {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["7z"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["7z"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        structural::sevenz(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = structural::sevenz(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        extract(ctx, scratch.path(), dir)?;
        Ok(Carved::length(length))
    }
}

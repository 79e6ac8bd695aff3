//! xz streams and legacy LZMA-alone data, decoded by xz-utils.

use std::path::Path;

use tracing::debug;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver};
use crate::checks::{flags, structural};
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

pub struct XzDriver;

impl XzDriver {
    fn stream_len(ctx: &CarveContext, offset: u64) -> Option<u64> {
        let stream_flags = flags::xz(ctx.source, offset)?;
        structural::xz_stream(ctx.source, offset, stream_flags, ctx.table.get("xztrailer"))
    }
}

impl FormatDriver for XzDriver {
    fn name(&self) -> &'static str {
        "xz"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["xz"]
    }

    fn auxiliary_markers(&self) -> &'static [&'static str] {
        &["xztrailer"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["xz"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        Self::stream_len(ctx, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = Self::stream_len(ctx, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("xz").arg("-t").arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        let target = dir.join(ctx.stream_output_name());
        ctx.run_tool(
            &Invocation::new("xz")
                .arg("-dc")
                .arg(scratch.path())
                .stdout_to(&target),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if std::fs::metadata(&target)?.len() == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

/// `lzma -cd` reports trailing garbage after the stream as an error even
/// though the decoded output is complete; the output size is judged instead.
const LZMA_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[OutcomeRule::new(ExitMatch::Any, Outcome::Success)],
    benign_stderr: None,
};

pub struct LzmaDriver;

impl FormatDriver for LzmaDriver {
    fn name(&self) -> &'static str {
        "lzma"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["lzma_alone", "lzma_alone_alt", "lzma_alone_alt2"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["lzma"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::lzma(ctx.source, offset, ctx.options.lzma_try_all()).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let header = flags::lzma(ctx.source, offset, ctx.options.lzma_try_all())
            .ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, ctx.unclaimed_span(offset))?;
        let target = dir.join(ctx.stream_output_name());
        ctx.run_tool(
            &Invocation::new("lzma")
                .arg("-cd")
                .arg(scratch.path())
                .stdout_to(&target),
            &LZMA_OUTCOMES,
        )?;
        let written = std::fs::metadata(&target)?.len();
        let accepted = match header.declared_size {
            Some(declared) => written == declared,
            None => written >= ctx.options.lzma_minimum_size(),
        };
        if !accepted {
            debug!("lzma at {offset:#x}: {written} bytes decoded, rejected");
            return Err(CarveError::ExpectedMiss);
        }
        // the stream end is not reported by the tool
        Ok(Carved::length(0))
    }
}

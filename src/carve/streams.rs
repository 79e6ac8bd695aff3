//! Single-stream compressors that decode to stdout through an external tool:
//! lzip, lzop, Unix compress and lrzip.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::flags;
use crate::scratch::ScratchFile;
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

/// Decode `scratch` with `program args.. <scratch>` into the stream output
/// file of `dir`. Returns the output path and its size.
fn decode_to_file(
    ctx: &CarveContext,
    program: &str,
    args: &[&str],
    scratch: &ScratchFile,
    dir: &Path,
    outcomes: &OutcomeTable,
) -> Result<(PathBuf, u64), CarveError> {
    let target = dir.join(ctx.stream_output_name());
    let invocation = Invocation::new(program)
        .args(args)
        .arg(scratch.path())
        .stdout_to(&target);
    ctx.run_tool(&invocation, outcomes)?;
    let written = std::fs::metadata(&target)?.len();
    Ok((target, written))
}

static LZIP_MEMBER_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"member size\s+(\d+)").expect("member size pattern"));

pub struct LzipDriver;

impl FormatDriver for LzipDriver {
    fn name(&self) -> &'static str {
        "lzip"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["lzip"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["lzip"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::lzip(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let scratch = ctx.carve_range(self.name(), offset, ctx.unclaimed_span(offset))?;
        let (_, written) = decode_to_file(ctx, "lzip", &["-dc"], &scratch, dir, &OutcomeTable::EXIT_ZERO)?;
        if written == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        // decoding worked but a failing test means the reported size is unusable
        let listing = ctx
            .describe(&Invocation::new("lzip").arg("-vvvvt").arg(scratch.path()))
            .ok_or_else(|| CarveError::CorruptPartialOutput("lzip -t failed".to_string()))?;
        let length = LZIP_MEMBER_SIZE
            .captures(&listing.stderr_text())
            .and_then(|caps| caps[1].parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Carved::length(length))
    }
}

pub struct LzoDriver;

impl FormatDriver for LzoDriver {
    fn name(&self) -> &'static str {
        "lzo"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["lzo"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["lzop"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::lzo(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let span = ctx.unclaimed_span(offset);
        let scratch = ctx.carve_range(self.name(), offset, span)?;
        let (_, written) = decode_to_file(ctx, "lzop", &["-dc"], &scratch, dir, &OutcomeTable::EXIT_ZERO)?;
        if written == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        // concatenated or padded data decodes fine but fails the test, in
        // which case the extent is unknown
        let tested = ctx
            .describe(&Invocation::new("lzop").arg("-t").arg(scratch.path()))
            .is_some();
        Ok(Carved::length(if tested { span } else { 0 }))
    }
}

/// `uncompress` complains about trailing data but still writes everything it
/// decoded; the output size decides.
const COMPRESS_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[OutcomeRule::new(ExitMatch::Any, Outcome::Success)],
    benign_stderr: None,
};

pub struct CompressDriver;

impl FormatDriver for CompressDriver {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["compress"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["uncompress"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::compress(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let scratch = ctx.carve_range(self.name(), offset, ctx.unclaimed_span(offset))?;
        let (_, written) = decode_to_file(ctx, "uncompress", &["-c"], &scratch, dir, &COMPRESS_OUTCOMES)?;
        if written < ctx.options.compress_minimum_size().max(1) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(0))
    }
}

pub struct LrzipDriver;

impl FormatDriver for LrzipDriver {
    fn name(&self) -> &'static str {
        "lrzip"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["lrzip"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["lrzip"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::lrzip(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let span = ctx.unclaimed_span(offset);
        let scratch = ctx.carve_range(self.name(), offset, span)?;
        let target = dir.join(ctx.stream_output_name());
        ctx.run_tool(
            &Invocation::new("lrzip")
                .args(["-d", "-q", "-f", "-o"])
                .arg(&target)
                .arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if !has_output(dir) || std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0) == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        // lrzip has no trailer; the stream is assumed to run to the next claim
        Ok(Carved::length(span))
    }
}

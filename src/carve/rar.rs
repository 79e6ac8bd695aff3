//! RAR archives (v4 and v5) through `unrar`.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::structural;
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

/// Totals line of `unrar vt`: `  <files>  <unpacked>  <packed>  <ratio>%`.
static TOTALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\d+\s+\d+\s+(\d+)\s+\d+%").expect("unrar totals pattern"));

/// Exit 1 is a non-fatal warning.
const UNRAR_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
        OutcomeRule::new(ExitMatch::Code(1), Outcome::Success),
    ],
    benign_stderr: None,
};

/// Packed size from the last line of a technical listing.
fn packed_total(listing: &str) -> Option<u64> {
    let last = listing.trim().lines().last()?;
    TOTALS.captures(last)?[1].parse().ok()
}

pub struct RarDriver;

impl FormatDriver for RarDriver {
    fn name(&self) -> &'static str {
        "rar"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["rar"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["unrar"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        structural::rar(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let scratch = ctx.carve_range(self.name(), offset, ctx.unclaimed_span(offset))?;
        let listing = ctx.run_tool(
            &Invocation::new("unrar").arg("vt").arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        let length = packed_total(&listing.stdout_text())
            .filter(|&len| len <= ctx.unclaimed_span(offset))
            .unwrap_or(0);
        ctx.run_tool(
            &Invocation::new("unrar")
                .args(["x", "-o+", "-y", "-idq"])
                .arg(scratch.path())
                .current_dir(dir),
            &UNRAR_OUTCOMES,
        )?;
        if !has_output(dir) {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(length))
    }
}

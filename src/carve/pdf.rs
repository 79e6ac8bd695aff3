//! PDF documents: paired with a trailer by the checker, confirmed with
//! `pdfinfo`, then copied out like the other pass-through formats.

use std::path::Path;

use crate::carve::copy::copy_out;
use crate::carve::{CarveContext, CarveError, Carved, FormatDriver};
use crate::checks::structural;
use crate::tool::{Invocation, OutcomeTable};

pub struct PdfDriver;

impl PdfDriver {
    fn document_len(ctx: &CarveContext, offset: u64) -> Option<u64> {
        structural::pdf(ctx.source, offset, ctx.table.get("pdftrailer"))
    }
}

impl FormatDriver for PdfDriver {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["pdf"]
    }

    fn auxiliary_markers(&self) -> &'static [&'static str] {
        &["pdftrailer"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["pdfinfo"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        Self::document_len(ctx, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = Self::document_len(ctx, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, length)?;
        ctx.run_tool(
            &Invocation::new("pdfinfo").arg(scratch.path()),
            &OutcomeTable::EXIT_ZERO,
        )?;
        copy_out(ctx, offset, length, dir, "pdf")?;
        Ok(Carved::length(length))
    }
}

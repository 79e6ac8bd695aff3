//! Whole-file transforms: byte-swapped flash dumps, compressed Flash movies
//! and base64 text. Each one rewrites the entire input into a single file
//! that is then scanned like any other.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::carve::gzip::inflate_stream;
use crate::carve::{CarveContext, CarveError, Carved, FormatDriver};
use crate::checks::{flags, structural};
use crate::scanner::OffsetTable;
use crate::tool::{Invocation, OutcomeTable};

const SWAP_CHUNK: u64 = 1024 * 1024;

/// True when nothing in the file has been claimed yet.
fn untouched(ctx: &CarveContext) -> bool {
    ctx.unclaimed_span(0) == ctx.file_len()
}

pub struct ByteSwapDriver;

impl FormatDriver for ByteSwapDriver {
    fn name(&self) -> &'static str {
        "byteswap"
    }

    fn markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn candidates(&self, _table: &OffsetTable) -> Vec<u64> {
        vec![0]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        offset == 0 && untouched(ctx) && structural::byteswapped(ctx.source)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let len = ctx.file_len();
        let target = dir.join(format!("{}.swapped", ctx.basename()));
        let mut writer = BufWriter::new(File::create(&target)?);
        let mut buf = vec![0u8; SWAP_CHUNK as usize];
        let mut pos = offset;
        while pos < len {
            let want = (len - pos).min(SWAP_CHUNK) as usize;
            let chunk = &mut buf[..want];
            let read = ctx
                .source
                .read_full_at(pos, chunk)
                .map_err(|err| CarveError::Io(std::io::Error::other(err)))?;
            if read != want {
                return Err(CarveError::ExpectedMiss);
            }
            for pair in chunk.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
            writer.write_all(chunk)?;
            pos += want as u64;
        }
        writer.flush()?;
        Ok(Carved::length(len))
    }
}

pub struct SwfDriver;

impl FormatDriver for SwfDriver {
    fn name(&self) -> &'static str {
        "swf"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["swf"]
    }

    /// Only a movie that starts the file is unpacked.
    fn candidates(&self, table: &OffsetTable) -> Vec<u64> {
        table.get("swf").iter().copied().filter(|&o| o == 0).collect()
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        offset == 0 && flags::swf(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let header = flags::swf(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let target = dir.join(format!("{}.body", ctx.basename()));
        let body = inflate_stream(ctx.source, offset + flags::SWF_HEADER_LEN, &target, true)?;
        if body.output_len + flags::SWF_HEADER_LEN != u64::from(header.declared_len) {
            return Err(CarveError::CorruptPartialOutput(format!(
                "swf body is {} bytes, header declares {}",
                body.output_len,
                u64::from(header.declared_len).saturating_sub(flags::SWF_HEADER_LEN)
            )));
        }
        Ok(Carved::length(flags::SWF_HEADER_LEN + body.deflate_len))
    }
}

pub struct Base64Driver;

impl FormatDriver for Base64Driver {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["base64"]
    }

    fn candidates(&self, _table: &OffsetTable) -> Vec<u64> {
        vec![0]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        offset == 0 && untouched(ctx) && structural::base64_text(ctx.source)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let len = ctx.file_len();
        let scratch = ctx.carve_range(self.name(), offset, len)?;
        let target = dir.join(ctx.stream_output_name());
        ctx.run_tool(
            &Invocation::new("base64")
                .arg("-d")
                .arg(scratch.path())
                .stdout_to(&target),
            &OutcomeTable::EXIT_ZERO,
        )?;
        if std::fs::metadata(&target)?.len() == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        Ok(Carved::length(len))
    }
}

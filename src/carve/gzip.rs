//! gzip members, inflated in-process.
//!
//! The deflate stream is decoded with `flate2` straight from the source so
//! the exact member length is known: header, compressed bytes, then the
//! eight-byte CRC32/ISIZE trailer, which must match what was inflated.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::{Decompress, FlushDecompress, Status};

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, rename_output};
use crate::checks::flags;
use crate::config::sanitize_file_name;
use crate::source::{ByteSource, SourceReader, u32_le};

const BUF_SIZE: usize = 64 * 1024;

pub struct GzipDriver;

impl FormatDriver for GzipDriver {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["gzip"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::gzip(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let header = flags::gzip(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let produced = dir.join(format!(".{}.partial", ctx.basename()));
        let member = inflate_member(ctx.source, offset + header.header_len, &produced)?;
        if member.output_len == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        let name = header
            .name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| ctx.stream_output_name());
        rename_output(dir, &produced, &name);
        Ok(Carved::length(header.header_len + member.deflate_len + 8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InflatedMember {
    /// Compressed bytes consumed, including a zlib header and trailer.
    pub deflate_len: u64,
    pub output_len: u64,
    /// CRC32 of the inflated data.
    pub crc: u32,
}

/// Inflate one raw deflate stream starting at `start`, write it to `target`
/// and verify the gzip trailer that follows it.
pub(crate) fn inflate_member(
    source: &dyn ByteSource,
    start: u64,
    target: &Path,
) -> Result<InflatedMember, CarveError> {
    let member = inflate_stream(source, start, target, false)?;
    let trailer = source
        .read_exact_at(start + member.deflate_len, 8)
        .ok_or(CarveError::ExpectedMiss)?;
    if u32_le(&trailer, 0) != member.crc || u32_le(&trailer, 4) != member.output_len as u32 {
        return Err(CarveError::CorruptPartialOutput(
            "gzip trailer does not match inflated data".to_string(),
        ));
    }
    Ok(member)
}

/// Inflate a deflate stream (zlib-wrapped when `zlib` is set) from `start`
/// into `target`. A stream that ends early or fails to decode is a miss.
pub(crate) fn inflate_stream(
    source: &dyn ByteSource,
    start: u64,
    target: &Path,
    zlib: bool,
) -> Result<InflatedMember, CarveError> {
    let mut reader = SourceReader::new(source, start, source.len());
    let mut writer = BufWriter::new(File::create(target)?);
    let mut inflater = Decompress::new(zlib);
    let mut crc = crc32fast::Hasher::new();
    let mut input = vec![0u8; BUF_SIZE];
    let mut output = vec![0u8; BUF_SIZE];
    let (mut pos, mut filled) = (0usize, 0usize);

    loop {
        if pos == filled {
            filled = reader.read(&mut input)?;
            pos = 0;
        }
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(&input[pos..filled], &mut output, FlushDecompress::None)
            .map_err(|_| CarveError::ExpectedMiss)?;
        let used = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;
        pos += used;
        writer.write_all(&output[..produced])?;
        crc.update(&output[..produced]);

        if status == Status::StreamEnd {
            break;
        }
        if used == 0 && produced == 0 && (filled == 0 || pos < filled) {
            // truncated input, or no progress on the bytes we have
            return Err(CarveError::ExpectedMiss);
        }
    }
    writer.flush()?;

    Ok(InflatedMember {
        deflate_len: inflater.total_in(),
        output_len: inflater.total_out(),
        crc: crc.finalize(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{DeflateEncoder, GzEncoder};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("write");
        encoder.finish().expect("finish")
    }

    #[test]
    fn inflates_member_and_reports_length() {
        let payload = b"firmware payload ".repeat(100);
        let member = gzip(&payload);
        let mut data = b"prefix".to_vec();
        data.extend_from_slice(&member);
        data.extend_from_slice(b"suffix bytes");

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out");
        let header = flags::gzip(&data, 6).expect("header");
        let inflated = inflate_member(&data, 6 + header.header_len, &target).expect("inflate");
        assert_eq!(header.header_len + inflated.deflate_len + 8, member.len() as u64);
        assert_eq!(inflated.output_len, payload.len() as u64);
        assert_eq!(std::fs::read(&target).expect("read"), payload);
    }

    #[test]
    fn truncated_member_is_a_miss() {
        let member = gzip(&b"abcdefgh".repeat(1000));
        let data = member[..member.len() / 2].to_vec();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = flags::gzip(&data, 0).expect("header");
        let err = inflate_member(&data, header.header_len, &dir.path().join("out"));
        assert!(matches!(err, Err(CarveError::ExpectedMiss)));
    }

    #[test]
    fn bad_trailer_is_rejected() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello").expect("write");
        let mut data = encoder.finish().expect("finish");
        data.extend_from_slice(&[0u8; 8]);
        let dir = tempfile::tempdir().expect("tempdir");
        let err = inflate_member(&data, 0, &dir.path().join("out"));
        assert!(matches!(err, Err(CarveError::CorruptPartialOutput(_))));
    }
}

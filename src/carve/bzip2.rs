//! bzip2 streams, decoded in-process.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use bzip2::{Decompress, Status};

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, rename_output};
use crate::checks::flags;
use crate::source::{ByteSource, SourceReader};

const BUF_SIZE: usize = 64 * 1024;

pub struct Bzip2Driver;

impl FormatDriver for Bzip2Driver {
    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["bzip2"]
    }

    fn is_compression(&self) -> bool {
        true
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        flags::bzip2(ctx.source, offset)
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let produced = dir.join(format!(".{}.partial", ctx.basename()));
        let (consumed, written) = decode_stream(ctx.source, offset, &produced)?;
        if written == 0 {
            return Err(CarveError::ExpectedMiss);
        }
        rename_output(dir, &produced, &ctx.stream_output_name());
        Ok(Carved::length(consumed))
    }
}

/// Decode a single bzip2 stream at `start` into `target`. Returns the
/// compressed and decompressed sizes.
pub(crate) fn decode_stream(
    source: &dyn ByteSource,
    start: u64,
    target: &Path,
) -> Result<(u64, u64), CarveError> {
    let mut reader = SourceReader::new(source, start, source.len());
    let mut writer = BufWriter::new(File::create(target)?);
    let mut decoder = Decompress::new(false);
    let mut input = vec![0u8; BUF_SIZE];
    let mut output = vec![0u8; BUF_SIZE];
    let (mut pos, mut filled) = (0usize, 0usize);

    loop {
        if pos == filled {
            filled = reader.read(&mut input)?;
            pos = 0;
        }
        let before_in = decoder.total_in();
        let before_out = decoder.total_out();
        let status = decoder
            .decompress(&input[pos..filled], &mut output)
            .map_err(|_| CarveError::ExpectedMiss)?;
        let used = (decoder.total_in() - before_in) as usize;
        let produced = (decoder.total_out() - before_out) as usize;
        pos += used;
        writer.write_all(&output[..produced])?;

        if status == Status::StreamEnd {
            break;
        }
        if used == 0 && produced == 0 && (filled == 0 || pos < filled) {
            return Err(CarveError::ExpectedMiss);
        }
    }
    writer.flush()?;
    Ok((decoder.total_in(), decoder.total_out()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;

    fn bzip2(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("write");
        encoder.finish().expect("finish")
    }

    #[test]
    fn stream_length_excludes_trailing_bytes() {
        let payload = b"squashfs? no, just text. ".repeat(50);
        let stream = bzip2(&payload);
        let mut data = stream.clone();
        data.extend_from_slice(b"trailing garbage after the stream");
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("out");
        let (consumed, written) = decode_stream(&data, 0, &target).expect("decode");
        assert_eq!(consumed, stream.len() as u64);
        assert_eq!(written, payload.len() as u64);
        assert_eq!(std::fs::read(&target).expect("read"), payload);
    }

    #[test]
    fn corrupt_stream_is_a_miss() {
        let mut stream = bzip2(&b"0123456789".repeat(100));
        let mid = stream.len() / 2;
        stream[mid] ^= 0xff;
        stream[mid + 1] ^= 0xff;
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(decode_stream(&stream, 0, &dir.path().join("out")).is_err());
    }
}

//! Version and flag byte validation for single-stream compressors.

use crate::source::{ByteSource, u64_le};

pub const GZIP_MAGIC: [u8; 3] = [0x1F, 0x8B, 0x08];

const GZIP_FHCRC: u8 = 0x02;
const GZIP_FEXTRA: u8 = 0x04;
const GZIP_FNAME: u8 = 0x08;
const GZIP_FCOMMENT: u8 = 0x10;
/// FEXTRA (multi-part), encrypted (bit 5) and the two reserved bits.
const GZIP_REJECTED_FLAGS: u8 = GZIP_FEXTRA | 0x20 | 0x40 | 0x80;

const MAX_GZIP_STRING: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipHeader {
    /// Bytes from the magic to the first deflate byte.
    pub header_len: u64,
    /// Original file name from the FNAME field.
    pub name: Option<String>,
}

/// Validate a gzip member header and the first deflate block type.
pub fn gzip(source: &dyn ByteSource, offset: u64) -> Option<GzipHeader> {
    let fixed = source.read_exact_at(offset, 10)?;
    if fixed[0..3] != GZIP_MAGIC {
        return None;
    }
    let flags = fixed[3];
    if flags & GZIP_REJECTED_FLAGS != 0 {
        return None;
    }
    let mut cursor = offset + 10;
    let mut name = None;
    if flags & GZIP_FNAME != 0 {
        let (raw, next) = read_cstring(source, cursor)?;
        name = Some(String::from_utf8_lossy(&raw).into_owned());
        cursor = next;
    }
    if flags & GZIP_FCOMMENT != 0 {
        let (_, next) = read_cstring(source, cursor)?;
        cursor = next;
    }
    if flags & GZIP_FHCRC != 0 {
        cursor += 2;
    }
    let first = source.read_exact_at(cursor, 1)?[0];
    // BTYPE 11 is reserved
    if (first >> 1) & 0b11 == 0b11 {
        return None;
    }
    Some(GzipHeader {
        header_len: cursor - offset,
        name,
    })
}

fn read_cstring(source: &dyn ByteSource, offset: u64) -> Option<(Vec<u8>, u64)> {
    let limit = source.remaining(offset).min(MAX_GZIP_STRING) as usize;
    let window = source.read_upto(offset, limit).ok()?;
    let end = memchr::memchr(0, &window)?;
    Some((window[..end].to_vec(), offset + end as u64 + 1))
}

const BZIP2_BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];
const BZIP2_EOS_MAGIC: [u8; 6] = [0x17, 0x72, 0x45, 0x38, 0x50, 0x90];

/// `BZh`, a block size digit, then a block or end-of-stream magic.
pub fn bzip2(source: &dyn ByteSource, offset: u64) -> bool {
    let Some(header) = source.read_exact_at(offset, 10) else {
        return false;
    };
    if &header[0..3] != b"BZh" || !(b'1'..=b'9').contains(&header[3]) {
        return false;
    }
    header[4..10] == BZIP2_BLOCK_MAGIC || header[4..10] == BZIP2_EOS_MAGIC
}

/// Dictionary-size bytes (offset + 3, offset + 4) seen on real LZMA streams.
const LZMA_DICTIONARY_BYTES: [[u8; 2]; 21] = [
    [0x01, 0x00],
    [0x02, 0x00],
    [0x03, 0x00],
    [0x04, 0x00],
    [0x06, 0x00],
    [0x08, 0x00],
    [0x10, 0x00],
    [0x20, 0x00],
    [0x30, 0x00],
    [0x40, 0x00],
    [0x60, 0x00],
    [0x80, 0x00],
    [0x80, 0x01],
    [0x0c, 0x00],
    [0x18, 0x00],
    [0x00, 0x00],
    [0x00, 0x01],
    [0x00, 0x02],
    [0x00, 0x03],
    [0x00, 0x04],
    [0xc0, 0x00],
];

/// Upper bound accepted for a declared LZMA uncompressed size (256 GiB).
const LZMA_MAX_DECLARED: u64 = 274_877_906_944;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaHeader {
    /// Uncompressed size from the header, `None` when marked unknown.
    pub declared_size: Option<u64>,
}

/// LZMA-alone header: known dictionary bytes (unless `try_all`) and a
/// plausible declared size.
pub fn lzma(source: &dyn ByteSource, offset: u64, try_all: bool) -> Option<LzmaHeader> {
    let header = source.read_exact_at(offset, 13)?;
    if header[0] >= 225 {
        return None;
    }
    if !try_all && !LZMA_DICTIONARY_BYTES.contains(&[header[3], header[4]]) {
        return None;
    }
    if header[5..13].iter().all(|&b| b == 0xff) {
        return Some(LzmaHeader { declared_size: None });
    }
    let size = u64_le(&header, 5);
    if size == 0 || size > LZMA_MAX_DECLARED {
        return None;
    }
    Some(LzmaHeader {
        declared_size: Some(size),
    })
}

/// `LZIP` followed by version 0 or 1.
pub fn lzip(source: &dyn ByteSource, offset: u64) -> bool {
    match source.read_exact_at(offset, 6) {
        Some(header) => &header[0..4] == b"LZIP" && header[4] <= 1,
        None => false,
    }
}

pub const LZO_MAGIC: [u8; 9] = [0x89, 0x4c, 0x5a, 0x4f, 0x00, 0x0d, 0x0a, 0x1a, 0x0a];

/// lzop magic and a known version nibble.
pub fn lzo(source: &dyn ByteSource, offset: u64) -> bool {
    match source.read_exact_at(offset, 10) {
        Some(header) => header[0..9] == LZO_MAGIC && matches!(header[9] & 0xf0, 0x00 | 0x10 | 0x20),
        None => false,
    }
}

/// Unix compress: bits per code between 9 and 16.
pub fn compress(source: &dyn ByteSource, offset: u64) -> bool {
    match source.read_exact_at(offset, 3) {
        Some(header) => {
            header[0..2] == [0x1f, 0x9d] && (9..=16).contains(&(header[2] & 0x1f))
        }
        None => false,
    }
}

pub const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// xz stream header: magic, defined flag bits and the CRC32 over the flags.
/// Returns the two stream flag bytes, which the footer must repeat.
pub fn xz(source: &dyn ByteSource, offset: u64) -> Option<[u8; 2]> {
    let header = source.read_exact_at(offset, 12)?;
    if header[0..6] != XZ_MAGIC {
        return None;
    }
    let flags = [header[6], header[7]];
    if flags[0] != 0 || flags[1] & 0xf0 != 0 {
        return None;
    }
    let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    (crc32fast::hash(&flags) == stored).then_some(flags)
}

/// `LRZI` with major version 0 and minor version up to 8.
pub fn lrzip(source: &dyn ByteSource, offset: u64) -> bool {
    match source.read_exact_at(offset, 6) {
        Some(header) => &header[0..4] == b"LRZI" && header[4] == 0 && header[5] <= 8,
        None => false,
    }
}

/// Bytes before the zlib stream of a compressed Flash movie.
pub const SWF_HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwfHeader {
    pub version: u8,
    /// Declared length of the uncompressed movie, header included.
    pub declared_len: u32,
}

/// Compressed Flash movie: `CWS`, a version byte, the uncompressed length and
/// a zlib stream header without a preset dictionary.
pub fn swf(source: &dyn ByteSource, offset: u64) -> Option<SwfHeader> {
    let header = source.read_exact_at(offset, 10)?;
    if &header[0..3] != b"CWS" {
        return None;
    }
    let (cmf, flg) = (header[8], header[9]);
    let zlib_ok = cmf & 0x0f == 8
        && cmf >> 4 <= 7
        && flg & 0x20 == 0
        && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0;
    let declared_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (zlib_ok && u64::from(declared_len) > SWF_HEADER_LEN).then_some(SwfHeader {
        version: header[3],
        declared_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swf_needs_zlib_stream_header() {
        let mut data = b"CWS\x0a".to_vec();
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&[0x78, 0x9c, 0x00]);
        let header = swf(&data, 0).expect("swf header");
        assert_eq!(header.version, 10);
        assert_eq!(header.declared_len, 100);

        data[9] = 0x9d;
        assert_eq!(swf(&data, 0), None);
        data[9] = 0x9c;
        data[0] = b'F';
        assert_eq!(swf(&data, 0), None);
    }

    fn gzip_bytes(flags: u8, extra: &[u8], first_deflate: u8) -> Vec<u8> {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0x1f, 0x8b, 0x08, flags, 0, 0, 0, 0, 0, 3]);
        data.extend_from_slice(extra);
        data.push(first_deflate);
        data
    }

    #[test]
    fn gzip_header_with_name_and_crc() {
        let data = gzip_bytes(GZIP_FNAME | GZIP_FHCRC, b"fw.bin\0\xaa\xbb", 0x01);
        let header = gzip(&data, 4).expect("header");
        assert_eq!(header.name.as_deref(), Some("fw.bin"));
        assert_eq!(header.header_len, 10 + 7 + 2);
    }

    #[test]
    fn gzip_rejects_extra_encrypted_and_reserved() {
        for flags in [GZIP_FEXTRA, 0x20, 0x40, 0x80] {
            let data = gzip_bytes(flags, &[], 0x01);
            assert!(gzip(&data, 4).is_none(), "flags {flags:#x}");
        }
    }

    #[test]
    fn gzip_rejects_reserved_block_type() {
        let data = gzip_bytes(0, &[], 0b0000_0111);
        assert!(gzip(&data, 4).is_none());
    }

    #[test]
    fn gzip_rejects_unterminated_name() {
        let data = gzip_bytes(GZIP_FNAME, b"no-terminator", 0x41);
        assert!(gzip(&data, 4).is_none());
    }

    #[test]
    fn bzip2_block_and_empty_stream() {
        let mut data = b"BZh9".to_vec();
        data.extend_from_slice(&BZIP2_BLOCK_MAGIC);
        assert!(bzip2(&data, 0));
        let mut empty = b"BZh1".to_vec();
        empty.extend_from_slice(&BZIP2_EOS_MAGIC);
        assert!(bzip2(&empty, 0));
        let mut bad = b"BZh0".to_vec();
        bad.extend_from_slice(&BZIP2_BLOCK_MAGIC);
        assert!(!bzip2(&bad, 0));
    }

    #[test]
    fn lzma_dictionary_and_size() {
        let mut data = vec![0x5d, 0x00, 0x00, 0x80, 0x00];
        data.extend_from_slice(&[0xff; 8]);
        assert_eq!(lzma(&data, 0, false), Some(LzmaHeader { declared_size: None }));

        data[5..13].copy_from_slice(&1234u64.to_le_bytes());
        assert_eq!(
            lzma(&data, 0, false),
            Some(LzmaHeader {
                declared_size: Some(1234)
            })
        );

        data[5..13].copy_from_slice(&0u64.to_le_bytes());
        assert_eq!(lzma(&data, 0, false), None);

        data[5..13].copy_from_slice(&1234u64.to_le_bytes());
        data[3] = 0x77;
        assert_eq!(lzma(&data, 0, false), None);
        assert!(lzma(&data, 0, true).is_some());
    }

    #[test]
    fn lzip_lzo_compress_lrzip_versions() {
        assert!(lzip(&b"LZIP\x01\x0c".to_vec(), 0));
        assert!(!lzip(&b"LZIP\x02\x0c".to_vec(), 0));

        let mut lz = LZO_MAGIC.to_vec();
        lz.push(0x10);
        assert!(lzo(&lz, 0));
        lz[9] = 0x30;
        assert!(!lzo(&lz, 0));

        assert!(compress(&vec![0x1f, 0x9d, 0x90], 0));
        assert!(!compress(&vec![0x1f, 0x9d, 0x88], 0));

        assert!(lrzip(&b"LRZI\x00\x06".to_vec(), 0));
        assert!(!lrzip(&b"LRZI\x01\x06".to_vec(), 0));
    }

    #[test]
    fn xz_header_crc() {
        let flags = [0x00u8, 0x04];
        let mut data = XZ_MAGIC.to_vec();
        data.extend_from_slice(&flags);
        data.extend_from_slice(&crc32fast::hash(&flags).to_le_bytes());
        assert_eq!(xz(&data, 0), Some(flags));
        data[8] ^= 0xff;
        assert_eq!(xz(&data, 0), None);
    }
}

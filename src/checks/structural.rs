//! Formats validated by walking their structure or pairing a header with a
//! trailer found by the scanner.

use std::io::{BufReader, Read};

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::checks::{MAX_CHECKSUM_SPAN, read_span};
use crate::source::{ByteSource, SourceReader, u16_le, u32_be, u32_le, u64_le};

const ZIP_LOCAL: [u8; 4] = *b"PK\x03\x04";
const ZIP_CENTRAL: [u8; 4] = *b"PK\x01\x02";
const ZIP_EOCD: [u8; 4] = *b"PK\x05\x06";
const ZIP_MAX_VERSION: u16 = 500;

/// ZIP local header with a sane "version needed", paired with the first end
/// of central directory record (from `eocd_offsets`) whose central directory
/// points back into the archive at a `PK\x01\x02` record. Returns the archive
/// length including the EOCD comment.
pub fn zip(source: &dyn ByteSource, offset: u64, eocd_offsets: &[u64]) -> Option<u64> {
    let local = source.read_exact_at(offset, 30)?;
    if local[0..4] != ZIP_LOCAL || u16_le(&local, 4) > ZIP_MAX_VERSION {
        return None;
    }
    for &eocd in eocd_offsets.iter().filter(|&&e| e > offset) {
        let Some(record) = source.read_exact_at(eocd, 22) else {
            continue;
        };
        if record[0..4] != ZIP_EOCD {
            continue;
        }
        let cd_size = u64::from(u32_le(&record, 12));
        let cd_offset = u64::from(u32_le(&record, 16));
        let comment_len = u64::from(u16_le(&record, 20));
        if offset + cd_offset + cd_size != eocd {
            continue;
        }
        match source.read_exact_at(offset + cd_offset, 4) {
            Some(sig) if sig[..] == ZIP_CENTRAL => {}
            _ => continue,
        }
        let end = eocd + 22 + comment_len;
        if end > source.len() {
            continue;
        }
        return Some(end - offset);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpioKind {
    /// `070701`/`070702`, hexadecimal fields
    NewAscii,
    /// `070707`, octal fields
    OldAscii,
}

impl CpioKind {
    fn header_len(self) -> u64 {
        match self {
            CpioKind::NewAscii => 110,
            CpioKind::OldAscii => 76,
        }
    }

    fn field_ok(self, b: u8) -> bool {
        match self {
            CpioKind::NewAscii => b.is_ascii_hexdigit(),
            CpioKind::OldAscii => (b'0'..=b'7').contains(&b),
        }
    }
}

fn cpio_header(source: &dyn ByteSource, offset: u64) -> Option<CpioKind> {
    let magic = source.read_exact_at(offset, 6)?;
    let kind = match &magic[..] {
        b"070701" | b"070702" => CpioKind::NewAscii,
        b"070707" => CpioKind::OldAscii,
        _ => return None,
    };
    let header = source.read_exact_at(offset, kind.header_len() as usize)?;
    header[6..].iter().all(|&b| kind.field_ok(b)).then_some(kind)
}

/// cpio archive header paired with the first `TRAILER!!!` record after it
/// that sits behind a header of the same kind. Returns the length through the
/// padded trailer record.
pub fn cpio(source: &dyn ByteSource, offset: u64, trailer_offsets: &[u64]) -> Option<u64> {
    let kind = cpio_header(source, offset)?;
    let header_len = kind.header_len();
    for &trailer in trailer_offsets {
        if trailer < offset + header_len {
            continue;
        }
        let record = trailer - header_len;
        if cpio_header(source, record) != Some(kind) {
            continue;
        }
        let end = match kind {
            CpioKind::NewAscii => record + align(header_len + 11, 4)?,
            CpioKind::OldAscii => trailer + 11,
        };
        return (end <= source.len()).then(|| end - offset);
    }
    None
}

/// `v` rounded up to a multiple of `to`, `None` on overflow.
fn align(v: u64, to: u64) -> Option<u64> {
    v.div_ceil(to).checked_mul(to)
}

static STARTXREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"startxref\s+\d+\s*$").expect("startxref pattern"));

const PDF_TRAILER_LOOKBACK: u64 = 100;

/// PDF header paired with the first `%%EOF` (from `trailer_offsets`) that has
/// a `startxref` entry in the 100 bytes before it. Returns the length through
/// the trailer and its end-of-line.
pub fn pdf(source: &dyn ByteSource, offset: u64, trailer_offsets: &[u64]) -> Option<u64> {
    let header = source.read_exact_at(offset, 8)?;
    if &header[0..5] != b"%PDF-" || !header[5].is_ascii_digit() || header[6] != b'.' {
        return None;
    }
    for &trailer in trailer_offsets.iter().filter(|&&t| t > offset) {
        let start = trailer.saturating_sub(PDF_TRAILER_LOOKBACK).max(offset);
        let Some(before) = source.read_exact_at(start, (trailer - start) as usize) else {
            continue;
        };
        if !STARTXREF.is_match(&before) {
            continue;
        }
        let mut end = trailer + 5;
        let eol = source.read_upto(end, 2).unwrap_or_default();
        end += match eol.as_slice() {
            [b'\r', b'\n', ..] => 2,
            [b'\n', ..] | [b'\r', ..] => 1,
            _ => 0,
        };
        return Some(end - offset);
    }
    None
}

/// GIF87a/GIF89a block walk through the trailer byte. Returns the length.
pub fn gif(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 13)?;
    if &header[0..6] != b"GIF87a" && &header[0..6] != b"GIF89a" {
        return None;
    }
    let mut reader = BufReader::new(SourceReader::new(source, offset + 13, source.len()));
    let mut consumed = 13u64;
    if header[10] & 0x80 != 0 {
        consumed += skip(&mut reader, color_table_len(header[10]))?;
    }
    let mut images = 0usize;
    loop {
        let introducer = read_u8(&mut reader)?;
        consumed += 1;
        match introducer {
            0x3B => return (images > 0).then_some(consumed),
            0x21 => {
                read_u8(&mut reader)?;
                consumed += 1 + skip_sub_blocks(&mut reader)?;
            }
            0x2C => {
                let mut descriptor = [0u8; 9];
                reader.read_exact(&mut descriptor).ok()?;
                consumed += 9;
                if descriptor[8] & 0x80 != 0 {
                    consumed += skip(&mut reader, color_table_len(descriptor[8]))?;
                }
                let min_code_size = read_u8(&mut reader)?;
                if !(2..=12).contains(&min_code_size) {
                    return None;
                }
                consumed += 1 + skip_sub_blocks(&mut reader)?;
                images += 1;
            }
            _ => return None,
        }
    }
}

fn color_table_len(flags: u8) -> u64 {
    3 * (1u64 << ((flags & 0x07) + 1))
}

fn read_u8(reader: &mut impl Read) -> Option<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).ok()?;
    Some(byte[0])
}

fn skip(reader: &mut impl Read, len: u64) -> Option<u64> {
    let copied = std::io::copy(&mut reader.take(len), &mut std::io::sink()).ok()?;
    (copied == len).then_some(len)
}

fn skip_sub_blocks(reader: &mut impl Read) -> Option<u64> {
    let mut consumed = 0u64;
    loop {
        let size = u64::from(read_u8(reader)?);
        consumed += 1;
        if size == 0 {
            return Some(consumed);
        }
        consumed += skip(reader, size)?;
    }
}

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// PNG chunk walk from IHDR to IEND, verifying every chunk CRC. Returns the
/// length through the IEND chunk.
pub fn png(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let signature = source.read_exact_at(offset, 8)?;
    if signature[..] != PNG_SIGNATURE {
        return None;
    }
    let mut cursor = offset + 8;
    let mut first = true;
    loop {
        let head = source.read_exact_at(cursor, 8)?;
        let len = u64::from(u32_be(&head, 0));
        let kind = [head[4], head[5], head[6], head[7]];
        if first && &kind != b"IHDR" {
            return None;
        }
        first = false;
        let body = read_span(source, cursor + 4, 4 + len, MAX_CHECKSUM_SPAN)?;
        let crc = source.read_exact_at(cursor + 8 + len, 4)?;
        if crc32fast::hash(&body) != u32_be(&crc, 0) {
            return None;
        }
        cursor += 12 + len;
        if &kind == b"IEND" {
            return Some(cursor - offset);
        }
    }
}

pub const TAR_MAGIC_OFFSET: u64 = 0x101;
const TAR_BLOCK: u64 = 512;

fn tar_octal(field: &[u8]) -> Option<u64> {
    // GNU base-256 for large values
    if field[0] & 0x80 != 0 {
        return field[1..].iter().try_fold(u64::from(field[0] & 0x7f), |acc, &b| {
            (acc >> 56 == 0).then(|| (acc << 8) | u64::from(b))
        });
    }
    let text: Vec<u8> = field
        .iter()
        .copied()
        .take_while(|&b| b != 0)
        .filter(|&b| b != b' ')
        .collect();
    if text.is_empty() {
        return Some(0);
    }
    let text = std::str::from_utf8(&text).ok()?;
    u64::from_str_radix(text, 8).ok()
}

fn tar_header_valid(block: &[u8]) -> bool {
    let Some(stored) = tar_octal(&block[148..156]) else {
        return false;
    };
    let computed: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u64::from(b' ') } else { u64::from(b) })
        .sum();
    stored == computed
}

/// tar archive: the first header checksum must match, then members are walked
/// until the end-of-archive zero blocks, EOF or an invalid header. Returns the
/// archive length.
pub fn tar(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let first = source.read_exact_at(offset, TAR_BLOCK as usize)?;
    if !tar_header_valid(&first) {
        return None;
    }
    let mut cursor = offset;
    loop {
        let Some(block) = source.read_exact_at(cursor, TAR_BLOCK as usize) else {
            break;
        };
        if block.iter().all(|&b| b == 0) {
            cursor += TAR_BLOCK;
            if let Some(next) = source.read_exact_at(cursor, TAR_BLOCK as usize) {
                if next.iter().all(|&b| b == 0) {
                    cursor += TAR_BLOCK;
                }
            }
            break;
        }
        if !tar_header_valid(&block) {
            break;
        }
        let Some(size) = tar_octal(&block[124..136]) else {
            break;
        };
        let next = align(size, TAR_BLOCK).and_then(|padded| (cursor + TAR_BLOCK).checked_add(padded));
        let Some(next) = next.filter(|&next| next <= source.len()) else {
            break;
        };
        cursor = next;
    }
    // a first member running past EOF leaves nothing to extract
    (cursor > offset).then(|| cursor - offset)
}

const AR_HEADER: u64 = 60;

/// `!<arch>\n` followed by at least one well-formed member header. Returns the
/// length through the last valid member.
pub fn ar(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let magic = source.read_exact_at(offset, 8)?;
    if &magic[..] != b"!<arch>\n" {
        return None;
    }
    let mut cursor = offset + 8;
    let mut members = 0usize;
    while let Some(header) = source.read_exact_at(cursor, AR_HEADER as usize) {
        if &header[58..60] != b"`\n" {
            break;
        }
        let size = std::str::from_utf8(&header[48..58])
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        let Some(size) = size else {
            break;
        };
        let Some(next) = align(size, 2).and_then(|padded| (cursor + AR_HEADER).checked_add(padded))
        else {
            break;
        };
        if (cursor + AR_HEADER).saturating_add(size) > source.len() {
            break;
        }
        members += 1;
        cursor = next.min(source.len());
    }
    (members > 0).then(|| cursor - offset)
}

pub const SEVENZ_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// 7z signature header: major version 0, start header CRC over the next
/// header location, and the next header CRC. Returns the archive length.
pub fn sevenz(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 32)?;
    if header[0..6] != SEVENZ_MAGIC || header[6] != 0 {
        return None;
    }
    if crc32fast::hash(&header[12..32]) != u32_le(&header, 8) {
        return None;
    }
    let next_offset = u64_le(&header, 12);
    let next_size = u64_le(&header, 20);
    let length = 32u64.checked_add(next_offset)?.checked_add(next_size)?;
    if next_size == 0 || length > source.remaining(offset) {
        return None;
    }
    let next = read_span(source, offset + 32 + next_offset, next_size, MAX_CHECKSUM_SPAN)?;
    (crc32fast::hash(&next) == u32_le(&header, 28)).then_some(length)
}

/// RAR signature; returns the archive format version (4 or 5).
pub fn rar(source: &dyn ByteSource, offset: u64) -> Option<u8> {
    let sig = source.read_exact_at(offset, 8)?;
    if &sig[0..6] != b"Rar!\x1a\x07" {
        return None;
    }
    match (sig[6], sig[7]) {
        (0x00, _) => Some(4),
        (0x01, 0x00) => Some(5),
        _ => None,
    }
}

/// Pair an xz stream header with the first stream footer (the `YZ` offsets in
/// `trailer_offsets`) that repeats its flags and has a valid CRC. Returns the
/// stream length.
pub fn xz_stream(
    source: &dyn ByteSource,
    offset: u64,
    flags: [u8; 2],
    trailer_offsets: &[u64],
) -> Option<u64> {
    for &magic in trailer_offsets.iter().filter(|&&t| t >= offset + 22) {
        let footer_start = magic - 10;
        let Some(footer) = source.read_exact_at(footer_start, 12) else {
            continue;
        };
        if footer[8..10] != flags || &footer[10..12] != b"YZ" {
            continue;
        }
        if crc32fast::hash(&footer[4..10]) != u32_le(&footer, 0) {
            continue;
        }
        return Some(magic + 2 - offset);
    }
    None
}

/// `Uncompressing Linux...` as it reads with every 16-bit word byte-swapped.
pub const SWAPPED_KERNEL_BANNER: &[u8] = b"nUocpmerssni giLun.x..";

const BANNER_SEARCH_WINDOW: u64 = 1024 * 1024;

/// Even-sized file holding the kernel decompressor banner with its bytes
/// swapped in pairs, the mark of a 16-bit NOR flash dump read with the wrong
/// byte order.
pub fn byteswapped(source: &dyn ByteSource) -> bool {
    let len = source.len();
    if len == 0 || len % 2 != 0 {
        return false;
    }
    let finder = memchr::memmem::Finder::new(SWAPPED_KERNEL_BANNER);
    let overlap = SWAPPED_KERNEL_BANNER.len() as u64 - 1;
    crate::chunk::windows(len, BANNER_SEARCH_WINDOW, overlap).any(|window| {
        source
            .read_upto(window.start, window.length as usize)
            .is_ok_and(|data| finder.find(&data).is_some())
    })
}

const BASE64_HEAD: usize = 4096;

fn base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\n' | b'\r')
}

/// File that starts as base64 text. Small files are checked completely,
/// including that the encoded characters come in groups of four.
pub fn base64_text(source: &dyn ByteSource) -> bool {
    let len = source.len();
    let Ok(head) = source.read_upto(0, BASE64_HEAD) else {
        return false;
    };
    if !head.iter().all(|&b| base64_byte(b)) {
        return false;
    }
    let encoded = head.iter().filter(|&&b| b != b'\n' && b != b'\r').count();
    if encoded < 4 {
        return false;
    }
    len > BASE64_HEAD as u64 || encoded % 4 == 0
}

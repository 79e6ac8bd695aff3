//! Formats whose headers carry a checksum or a self-consistent size table.

use sha1::{Digest, Sha1};

use crate::checks::{MAX_CHECKSUM_SPAN, adler32, jffs2_crc32, read_span};
use crate::source::{ByteSource, u16_be, u16_le, u32_be, u32_le};

pub const JFFS2_MAGIC: u16 = 0x1985;
const JFFS2_NODE_HEADER: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jffs2Node {
    pub big_endian: bool,
    pub total_len: u32,
}

/// One JFFS2 node header: magic, a length that stays inside the source and a
/// matching header CRC over the first eight bytes.
pub fn jffs2_node(source: &dyn ByteSource, offset: u64, big_endian: bool) -> Option<Jffs2Node> {
    let header = source.read_exact_at(offset, JFFS2_NODE_HEADER as usize)?;
    let read16 = if big_endian { u16_be } else { u16_le };
    let read32 = if big_endian { u32_be } else { u32_le };
    if read16(&header, 0) != JFFS2_MAGIC {
        return None;
    }
    let total_len = read32(&header, 4);
    if u64::from(total_len) < JFFS2_NODE_HEADER || u64::from(total_len) > source.remaining(offset) {
        return None;
    }
    if read32(&header, 8) != jffs2_crc32(&header[0..8]) {
        return None;
    }
    Some(Jffs2Node {
        big_endian,
        total_len,
    })
}

/// Length of a run of valid JFFS2 nodes starting at `offset`. Padding bytes
/// (0xff erased flash, or zero fill) between nodes are skipped in 4-byte steps
/// but never counted after the last node.
pub fn jffs2_extent(source: &dyn ByteSource, offset: u64, big_endian: bool) -> u64 {
    let mut cursor = offset;
    let mut end = offset;
    let len = source.len();
    while cursor + JFFS2_NODE_HEADER <= len {
        if let Some(node) = jffs2_node(source, cursor, big_endian) {
            cursor += align4(u64::from(node.total_len));
            end = cursor.min(len);
            continue;
        }
        match source.read_exact_at(cursor, 4) {
            Some(word) if word.iter().all(|&b| b == 0xff) || word.iter().all(|&b| b == 0) => {
                cursor += 4;
            }
            _ => break,
        }
    }
    end - offset
}

fn align4(v: u64) -> u64 {
    (v + 3) & !3
}

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
const SPARSE_HEADER_LEN: u16 = 28;
const SPARSE_CHUNK_HEADER_LEN: u16 = 12;
const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

/// Android sparse image: major version 1 and a chunk table whose declared
/// sizes match each chunk type. Returns the total image length.
pub fn android_sparse(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, SPARSE_HEADER_LEN as usize)?;
    if u32_le(&header, 0) != SPARSE_MAGIC || u16_le(&header, 4) != 1 {
        return None;
    }
    let file_header_len = u16_le(&header, 8);
    let chunk_header_len = u16_le(&header, 10);
    if file_header_len < SPARSE_HEADER_LEN || chunk_header_len < SPARSE_CHUNK_HEADER_LEN {
        return None;
    }
    let block_size = u64::from(u32_le(&header, 12));
    if block_size == 0 || block_size % 4 != 0 {
        return None;
    }
    let total_chunks = u32_le(&header, 20);
    let available = source.remaining(offset);
    let mut cursor = u64::from(file_header_len);
    for _ in 0..total_chunks {
        let chunk = source.read_exact_at(offset + cursor, SPARSE_CHUNK_HEADER_LEN as usize)?;
        let chunk_type = u16_le(&chunk, 0);
        let chunk_blocks = u64::from(u32_le(&chunk, 4));
        let total_size = u64::from(u32_le(&chunk, 8));
        let header_len = u64::from(chunk_header_len);
        let expected = match chunk_type {
            CHUNK_RAW => header_len + chunk_blocks.checked_mul(block_size)?,
            CHUNK_FILL | CHUNK_CRC32 => header_len + 4,
            CHUNK_DONT_CARE => header_len,
            _ => return None,
        };
        if total_size != expected {
            return None;
        }
        cursor = cursor.checked_add(total_size)?;
        if cursor > available {
            return None;
        }
    }
    Some(cursor)
}

const DEX_HEADER_LEN: u64 = 0x70;
const DEX_ENDIAN_TAG: u32 = 0x1234_5678;

/// Dex file: `dex\n` + three-digit version, Adler-32 over everything after
/// the checksum field and SHA-1 over everything after the signature. Returns
/// the declared file size.
pub fn dex(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, DEX_HEADER_LEN as usize)?;
    if &header[0..4] != b"dex\n" || !header[4..7].iter().all(u8::is_ascii_digit) || header[7] != 0 {
        return None;
    }
    let file_size = u64::from(u32_le(&header, 32));
    if u64::from(u32_le(&header, 36)) != DEX_HEADER_LEN || u32_le(&header, 40) != DEX_ENDIAN_TAG {
        return None;
    }
    if file_size < DEX_HEADER_LEN {
        return None;
    }
    let body = read_span(source, offset, file_size, MAX_CHECKSUM_SPAN)?;
    if adler32(&body[12..]) != u32_le(&header, 8) {
        return None;
    }
    let digest = Sha1::digest(&body[32..]);
    if digest.as_slice() != &header[12..32] {
        return None;
    }
    Some(file_size)
}

/// Optimized Dex: `dey\n036\0`, an embedded dex that validates on its own and
/// an Adler-32 over the dependency and optimized-data tables. Returns the
/// length through the last section.
pub fn odex(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 40)?;
    if &header[0..8] != b"dey\n036\0" {
        return None;
    }
    let dex_offset = u64::from(u32_le(&header, 8));
    let dex_length = u64::from(u32_le(&header, 12));
    let deps_offset = u64::from(u32_le(&header, 16));
    let deps_length = u64::from(u32_le(&header, 20));
    let opt_offset = u64::from(u32_le(&header, 24));
    let opt_length = u64::from(u32_le(&header, 28));
    let checksum = u32_le(&header, 36);

    if dex(source, offset + dex_offset)? != dex_length {
        return None;
    }
    let opt_end = opt_offset.checked_add(opt_length)?;
    if deps_offset > opt_end || deps_offset + deps_length > opt_end {
        return None;
    }
    let tables = read_span(source, offset + deps_offset, opt_end - deps_offset, MAX_CHECKSUM_SPAN)?;
    if adler32(&tables) != checksum {
        return None;
    }
    Some((dex_offset + dex_length).max(opt_end))
}

/// SQLite 3 database header: consistent page size, fixed payload fractions and
/// an in-header page count whose product with the page size fits the source.
pub fn sqlite3(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 100)?;
    if &header[0..16] != b"SQLite format 3\0" {
        return None;
    }
    let page_size = match u16_be(&header, 16) {
        1 => 65536u64,
        n if n >= 512 && n.is_power_of_two() => u64::from(n),
        _ => return None,
    };
    if !matches!(header[18], 1 | 2) || !matches!(header[19], 1 | 2) {
        return None;
    }
    if header[21] != 64 || header[22] != 32 || header[23] != 32 {
        return None;
    }
    let change_counter = u32_be(&header, 24);
    let page_count = u64::from(u32_be(&header, 28));
    // the page count is only authoritative when version-valid-for matches
    if page_count == 0 || u32_be(&header, 92) != change_counter {
        return None;
    }
    let size = page_size.checked_mul(page_count)?;
    (size <= source.remaining(offset)).then_some(size)
}

const APPLEDOUBLE_MAGIC: u32 = 0x0005_1607;
const APPLEDOUBLE_VERSION: u32 = 0x0002_0000;

/// AppleDouble header: magic, version 2 and an entry table whose entries all
/// lie after the table and inside the source. Returns the extent of the
/// furthest entry.
pub fn appledouble(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 26)?;
    if u32_be(&header, 0) != APPLEDOUBLE_MAGIC || u32_be(&header, 4) != APPLEDOUBLE_VERSION {
        return None;
    }
    let entries = u64::from(u16_be(&header, 24));
    if entries == 0 {
        return None;
    }
    let table_end = 26 + entries * 12;
    let table = source.read_exact_at(offset + 26, (entries * 12) as usize)?;
    let mut end = table_end;
    for entry in table.chunks_exact(12) {
        let entry_offset = u64::from(u32_be(entry, 4));
        let entry_len = u64::from(u32_be(entry, 8));
        if entry_offset < table_end {
            return None;
        }
        end = end.max(entry_offset + entry_len);
    }
    (end <= source.remaining(offset)).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn jffs2_node_bytes(total_len: u32, big_endian: bool) -> Vec<u8> {
        let mut node = Vec::new();
        if big_endian {
            node.extend_from_slice(&JFFS2_MAGIC.to_be_bytes());
            node.extend_from_slice(&0x2003u16.to_be_bytes());
            node.extend_from_slice(&total_len.to_be_bytes());
            let crc = jffs2_crc32(&node);
            node.extend_from_slice(&crc.to_be_bytes());
        } else {
            node.extend_from_slice(&JFFS2_MAGIC.to_le_bytes());
            node.extend_from_slice(&0x2003u16.to_le_bytes());
            node.extend_from_slice(&total_len.to_le_bytes());
            let crc = jffs2_crc32(&node);
            node.extend_from_slice(&crc.to_le_bytes());
        }
        node.resize(total_len as usize, 0x5a);
        node
    }

    #[test]
    fn jffs2_accepts_valid_crc_both_endians() {
        for be in [false, true] {
            let data = jffs2_node_bytes(12, be);
            assert_eq!(
                jffs2_node(&data, 0, be),
                Some(Jffs2Node {
                    big_endian: be,
                    total_len: 12
                })
            );
        }
    }

    #[test]
    fn jffs2_rejects_corrupt_crc_and_oversized_node() {
        let mut data = jffs2_node_bytes(12, false);
        data[8] ^= 0x01;
        assert!(jffs2_node(&data, 0, false).is_none());

        let mut data = jffs2_node_bytes(12, false);
        data.truncate(12);
        let mut long = jffs2_node_bytes(64, false);
        long.truncate(32);
        assert!(jffs2_node(&long, 0, false).is_none());
        assert!(jffs2_node(&data, 0, false).is_some());
    }

    #[test]
    fn jffs2_extent_skips_padding_between_nodes() {
        let mut data = jffs2_node_bytes(20, false);
        data.extend_from_slice(&[0xff; 8]);
        data.extend_from_slice(&jffs2_node_bytes(16, false));
        data.extend_from_slice(&[0xff; 16]);
        assert_eq!(jffs2_extent(&data, 0, false), 20 + 8 + 16);
    }

    fn sparse_image(chunks: &[(u16, u32, u32)], payload: usize) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&SPARSE_MAGIC.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&28u16.to_le_bytes());
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(&4096u32.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        for &(kind, blocks, total) in chunks {
            data.extend_from_slice(&kind.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes());
            data.extend_from_slice(&blocks.to_le_bytes());
            data.extend_from_slice(&total.to_le_bytes());
            data.resize(data.len() + (total as usize - 12), 0);
        }
        data.resize(data.len() + payload, 0xee);
        data
    }

    #[test]
    fn sparse_chunk_accounting() {
        let chunks = [(CHUNK_RAW, 1, 12 + 4096), (CHUNK_FILL, 3, 16), (CHUNK_DONT_CARE, 4, 12)];
        let data = sparse_image(&chunks, 100);
        assert_eq!(android_sparse(&data, 0), Some(28 + 4108 + 16 + 12));

        let bad = sparse_image(&[(CHUNK_FILL, 3, 20)], 0);
        assert_eq!(android_sparse(&bad, 0), None);
    }

    pub(crate) fn dex_bytes(body_len: usize) -> Vec<u8> {
        let file_size = 0x70 + body_len;
        let mut data = vec![0u8; file_size];
        data[0..8].copy_from_slice(b"dex\n035\0");
        data[32..36].copy_from_slice(&(file_size as u32).to_le_bytes());
        data[36..40].copy_from_slice(&0x70u32.to_le_bytes());
        data[40..44].copy_from_slice(&DEX_ENDIAN_TAG.to_le_bytes());
        for (i, b) in data[0x70..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let digest = Sha1::digest(&data[32..]);
        data[12..32].copy_from_slice(digest.as_slice());
        let sum = adler32(&data[12..]);
        data[8..12].copy_from_slice(&sum.to_le_bytes());
        data
    }

    #[test]
    fn dex_checksum_and_signature() {
        let mut data = vec![0u8; 7];
        data.extend_from_slice(&dex_bytes(64));
        assert_eq!(dex(&data, 7), Some(0x70 + 64));
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert_eq!(dex(&data, 7), None);
    }

    #[test]
    fn odex_wraps_valid_dex() {
        let dex_part = dex_bytes(32);
        let dex_len = dex_part.len() as u32;
        let deps = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let opt = vec![9u8; 16];
        let dex_offset = 40u32;
        let deps_offset = dex_offset + dex_len;
        let opt_offset = deps_offset + deps.len() as u32;
        let mut data = vec![0u8; 40];
        data[0..8].copy_from_slice(b"dey\n036\0");
        data[8..12].copy_from_slice(&dex_offset.to_le_bytes());
        data[12..16].copy_from_slice(&dex_len.to_le_bytes());
        data[16..20].copy_from_slice(&deps_offset.to_le_bytes());
        data[20..24].copy_from_slice(&(deps.len() as u32).to_le_bytes());
        data[24..28].copy_from_slice(&opt_offset.to_le_bytes());
        data[28..32].copy_from_slice(&(opt.len() as u32).to_le_bytes());
        let mut tables = deps.clone();
        tables.extend_from_slice(&opt);
        data[36..40].copy_from_slice(&adler32(&tables).to_le_bytes());
        data.extend_from_slice(&dex_part);
        data.extend_from_slice(&tables);
        assert_eq!(odex(&data, 0), Some(data.len() as u64));
        data[36] ^= 1;
        assert_eq!(odex(&data, 0), None);
    }

    fn sqlite_header(page_size: u16, pages: u32, counter: u32, valid_for: u32) -> Vec<u8> {
        let mut data = vec![0u8; 100];
        data[0..16].copy_from_slice(b"SQLite format 3\0");
        data[16..18].copy_from_slice(&page_size.to_be_bytes());
        data[18] = 1;
        data[19] = 1;
        data[21] = 64;
        data[22] = 32;
        data[23] = 32;
        data[24..28].copy_from_slice(&counter.to_be_bytes());
        data[28..32].copy_from_slice(&pages.to_be_bytes());
        data[92..96].copy_from_slice(&valid_for.to_be_bytes());
        data
    }

    #[test]
    fn sqlite_page_accounting() {
        let mut data = sqlite_header(1024, 2, 7, 7);
        data.resize(4096, 0);
        assert_eq!(sqlite3(&data, 0), Some(2048));

        let mut stale = sqlite_header(1024, 2, 7, 6);
        stale.resize(4096, 0);
        assert_eq!(sqlite3(&stale, 0), None);

        let mut too_big = sqlite_header(4096, 2, 1, 1);
        too_big.resize(4096, 0);
        assert_eq!(sqlite3(&too_big, 0), None);

        let mut odd = sqlite_header(1000, 1, 1, 1);
        odd.resize(4096, 0);
        assert_eq!(sqlite3(&odd, 0), None);
    }

    #[test]
    fn appledouble_entry_table() {
        let mut data = Vec::new();
        data.extend_from_slice(&APPLEDOUBLE_MAGIC.to_be_bytes());
        data.extend_from_slice(&APPLEDOUBLE_VERSION.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&2u16.to_be_bytes());
        // resource fork at 50, finder info at 60
        for (id, off, len) in [(2u32, 50u32, 10u32), (9u32, 60u32, 32u32)] {
            data.extend_from_slice(&id.to_be_bytes());
            data.extend_from_slice(&off.to_be_bytes());
            data.extend_from_slice(&len.to_be_bytes());
        }
        data.resize(120, 0);
        assert_eq!(appledouble(&data, 0), Some(92));
        data.truncate(80);
        assert_eq!(appledouble(&data, 0), None);
    }
}

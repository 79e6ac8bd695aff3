//! Cheap, read-only header validation run at each candidate offset before
//! any decoder is started.
//!
//! Every function here only reads from the [`ByteSource`] it is handed and
//! returns `None`/`false` for anything that does not look like the format.
//! Functions that can derive the format's length from the header return it so
//! the carving driver does not have to parse the header twice.

pub mod checksum;
pub mod flags;
pub mod sized;
pub mod structural;

use crate::source::ByteSource;

/// CRC32 variant used by JFFS2 node headers: initial value zero and no final
/// inversion.
pub fn jffs2_crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(0xFFFF_FFFF);
    hasher.update(data);
    !hasher.finalize()
}

/// Adler-32 as used by the Dex and Odex headers.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // largest n such that 255n(n+1)/2 + (n+1)(MOD-1) fits in u32
    const NMAX: usize = 5552;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for block in data.chunks(NMAX) {
        for &byte in block {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Read at most `limit` bytes starting at `offset` into memory for a
/// checksum, refusing spans that exceed the limit.
pub(crate) fn read_span(source: &dyn ByteSource, offset: u64, len: u64, limit: u64) -> Option<Vec<u8>> {
    if len > limit || len > source.remaining(offset) {
        return None;
    }
    source.read_exact_at(offset, len as usize)
}

/// Largest structure a checksum gate will read into memory.
pub const MAX_CHECKSUM_SPAN: u64 = 256 * 1024 * 1024;

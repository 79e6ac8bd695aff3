//! File systems whose superblock declares the total image size.

use crate::source::{ByteSource, u16_be, u16_le, u32_be, u32_le, u64_le};

const CRAMFS_SIGNATURE: &[u8; 16] = b"Compressed ROMFS";
const CRAMFS_MAGIC: u32 = 0x28CD_3D45;

/// cramfs superblock in either byte order. Returns the declared image size.
pub fn cramfs(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 64)?;
    let read32 = if u32_le(&header, 0) == CRAMFS_MAGIC {
        u32_le
    } else if u32_be(&header, 0) == CRAMFS_MAGIC {
        u32_be
    } else {
        return None;
    };
    if &header[16..32] != CRAMFS_SIGNATURE {
        return None;
    }
    let size = u64::from(read32(&header, 4));
    // old images (flags without FSID_VERSION_2) leave the size field unset
    let flags = read32(&header, 8);
    if size == 0 && flags & 1 == 0 {
        return Some(0);
    }
    (size >= 64 && size <= source.remaining(offset)).then_some(size)
}

/// romfs: BE size after the magic and a header checksum making the first
/// 512 bytes (or the whole image if smaller) sum to zero.
pub fn romfs(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let header = source.read_exact_at(offset, 16)?;
    if &header[0..8] != b"-rom1fs-" {
        return None;
    }
    let size = u64::from(u32_be(&header, 8));
    if size < 32 || size > source.remaining(offset) {
        return None;
    }
    let span = size.min(512) as usize & !3;
    let block = source.read_exact_at(offset, span)?;
    let sum = block
        .chunks_exact(4)
        .fold(0u32, |acc, word| acc.wrapping_add(u32_be(word, 0)));
    (sum == 0).then_some(size)
}

pub const EXT2_SUPERBLOCK: u64 = 1024;
const EXT2_MAGIC: u16 = 0xEF53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Superblock {
    pub block_count: u64,
    pub block_size: u64,
}

impl Ext2Superblock {
    pub fn image_size(&self) -> u64 {
        self.block_count * self.block_size
    }
}

/// ext2/3/4 primary superblock for a file system starting at `offset`.
pub fn ext2(source: &dyn ByteSource, offset: u64) -> Option<Ext2Superblock> {
    let sb = source.read_exact_at(offset + EXT2_SUPERBLOCK, 0x58)?;
    if u16_le(&sb, 0x38) != EXT2_MAGIC {
        return None;
    }
    if u32_le(&sb, 0x4C) > 1 {
        return None;
    }
    let log_block = u32_le(&sb, 24);
    if log_block > 6 {
        return None;
    }
    let superblock = Ext2Superblock {
        block_count: u64::from(u32_le(&sb, 4)),
        block_size: 1024u64 << log_block,
    };
    if superblock.block_count == 0 || superblock.image_size() > source.remaining(offset) {
        return None;
    }
    Some(superblock)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashfsVariant {
    /// `hsqs`/`sqsh`
    Standard,
    /// `shsq`/`qshs`, LZMA builds from vendor SDKs
    Lzma,
    /// `hsqt`/`tqsh`
    DdWrt,
    /// `sqlz`
    Realtek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquashfsSuperblock {
    pub variant: SquashfsVariant,
    pub big_endian: bool,
    pub major: u16,
    /// Image size, only present in version 4 superblocks.
    pub bytes_used: Option<u64>,
}

const SQUASHFS_MAGICS: [(&[u8; 4], SquashfsVariant, bool); 7] = [
    (b"hsqs", SquashfsVariant::Standard, false),
    (b"sqsh", SquashfsVariant::Standard, true),
    (b"shsq", SquashfsVariant::Lzma, false),
    (b"qshs", SquashfsVariant::Lzma, true),
    (b"hsqt", SquashfsVariant::DdWrt, false),
    (b"tqsh", SquashfsVariant::DdWrt, true),
    (b"sqlz", SquashfsVariant::Realtek, true),
];

/// A v4 image is at least its own superblock.
const SQUASHFS_V4_SUPERBLOCK: u64 = 96;

/// squashfs superblock with a known magic and major version 1 to 4.
pub fn squashfs(source: &dyn ByteSource, offset: u64) -> Option<SquashfsSuperblock> {
    let sb = source.read_exact_at(offset, 48)?;
    let (_, variant, mut big_endian) = SQUASHFS_MAGICS
        .iter()
        .copied()
        .find(|(magic, _, _)| sb[0..4] == magic[..])?;
    let mut major = if big_endian { u16_be(&sb, 28) } else { u16_le(&sb, 28) };
    if variant == SquashfsVariant::Realtek && !(1..=4).contains(&major) {
        big_endian = false;
        major = u16_le(&sb, 28);
    }
    if !(1..=4).contains(&major) {
        return None;
    }
    let mut bytes_used = None;
    if major == 4 && !big_endian {
        let used = u64_le(&sb, 40);
        if used < SQUASHFS_V4_SUPERBLOCK || used > source.remaining(offset) {
            return None;
        }
        bytes_used = Some(used);
    }
    Some(SquashfsSuperblock {
        variant,
        big_endian,
        major,
        bytes_used,
    })
}

pub const ISO9660_DESCRIPTOR: u64 = 32768;

/// ISO 9660 primary volume descriptor. Returns the volume size in bytes.
pub fn iso9660(source: &dyn ByteSource, offset: u64) -> Option<u64> {
    let pvd = source.read_exact_at(offset + ISO9660_DESCRIPTOR, 136)?;
    if pvd[0] != 1 || &pvd[1..6] != b"CD001" || pvd[6] != 1 {
        return None;
    }
    let blocks = u64::from(u32_le(&pvd, 80));
    let block_size = u64::from(u16_le(&pvd, 128));
    if blocks == 0 || !matches!(block_size, 512 | 1024 | 2048) {
        return None;
    }
    let size = blocks * block_size;
    (size <= source.remaining(offset)).then_some(size)
}

/// UBI erase counter header: magic and version 1, with the VID header and
/// data offsets inside a plausible erase block.
pub fn ubi(source: &dyn ByteSource, offset: u64) -> bool {
    let Some(header) = source.read_exact_at(offset, 64) else {
        return false;
    };
    if &header[0..4] != b"UBI#" || header[4] != 1 {
        return false;
    }
    let vid_offset = u32_be(&header, 16);
    let data_offset = u32_be(&header, 20);
    vid_offset >= 64 && data_offset > vid_offset && data_offset <= 0x4_0000
}

const YAFFS2_CHUNK_SIZES: [u64; 2] = [2048 + 64, 512 + 16];

/// yaffs2 images have no magic; only their size being a whole number of
/// chunk+spare units is checked.
pub fn yaffs2(source: &dyn ByteSource) -> bool {
    let len = source.len();
    len > 0 && YAFFS2_CHUNK_SIZES.iter().any(|unit| len % unit == 0)
}

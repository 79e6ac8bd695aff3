use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a regular file: {0}")]
    NotRegular(PathBuf),
}

/// Random-access, read-only view of the bytes being scanned.
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes remaining from `offset` to the end of the source.
    fn remaining(&self, offset: u64) -> u64 {
        self.len().saturating_sub(offset)
    }

    /// Fill `buf` completely, looping over short reads. Returns the number of
    /// bytes read, which is smaller than `buf.len()` only at end of source.
    fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read exactly `len` bytes, or `None` when the source is too short or
    /// unreadable at that position.
    fn read_exact_at(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_full_at(offset, &mut buf).ok()?;
        if n < len {
            return None;
        }
        Some(buf)
    }

    /// Read up to `len` bytes, truncated at end of source.
    fn read_upto(&self, offset: u64, len: usize) -> Result<Vec<u8>, SourceError> {
        let len = (self.remaining(offset)).min(len as u64) as usize;
        let mut buf = vec![0u8; len];
        let n = self.read_full_at(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

pub struct FileSource {
    file: File,
    len: u64,
    #[cfg(not(unix))]
    lock: std::sync::Mutex<()>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(SourceError::NotRegular(path.to_path_buf()));
        }
        Ok(Self {
            file,
            len: meta.len(),
            #[cfg(not(unix))]
            lock: std::sync::Mutex::new(()),
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self
                .lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))?;
            Ok(f.read(buf)?)
        }
    }
}

impl ByteSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        if offset >= self.as_slice().len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let to_copy = buf.len().min(self.as_slice().len() - start);
        buf[..to_copy].copy_from_slice(&self[start..start + to_copy]);
        Ok(to_copy)
    }
}

/// Sequential [`Read`](std::io::Read) over `[start, end)` of a source.
pub struct SourceReader<'a> {
    source: &'a dyn ByteSource,
    pos: u64,
    end: u64,
}

impl<'a> SourceReader<'a> {
    pub fn new(source: &'a dyn ByteSource, start: u64, end: u64) -> Self {
        Self {
            source,
            pos: start,
            end: end.min(source.len()),
        }
    }
}

impl std::io::Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let want = (self.end - self.pos).min(buf.len() as u64) as usize;
        let n = self
            .source
            .read_at(self.pos, &mut buf[..want])
            .map_err(|e| match e {
                SourceError::Io(io) => io,
                other => std::io::Error::other(other.to_string()),
            })?;
        self.pos += n as u64;
        Ok(n)
    }
}

pub(crate) fn u16_le(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn u16_be(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn u32_le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn u32_be(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn u64_le(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

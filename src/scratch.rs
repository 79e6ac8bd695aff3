//! Working directories and temporary copies for unpack attempts.
//!
//! Output directories are created beside the file being scanned and named
//! `<basename>-<format>-<counter>`. Carved byte ranges go into a private
//! temporary directory that is removed when the [`ScratchFile`] is dropped,
//! so every failure path cleans up by construction.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::blacklist::Blacklist;
use crate::source::{ByteSource, SourceReader};

/// Upper bound on name collisions tried before giving up on a directory.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Names and creates output directories for one scanned file.
#[derive(Debug)]
pub struct ScratchSpace {
    parent: PathBuf,
    basename: String,
    counters: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct ScratchDir {
    pub path: PathBuf,
    index: u32,
}

impl ScratchSpace {
    pub fn for_file(path: &Path) -> Self {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        Self {
            parent,
            basename,
            counters: HashMap::new(),
        }
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Create the next free `<basename>-<format>-<n>` directory.
    pub fn create_dir(&self, format: &str) -> std::io::Result<ScratchDir> {
        let start = self.counters.get(format).copied().unwrap_or(1);
        for index in start..start.saturating_add(MAX_NAME_ATTEMPTS) {
            let path = self
                .parent
                .join(format!("{}-{}-{}", self.basename, format, index));
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(ScratchDir { path, index }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free directory name for {} ({format})", self.basename),
        ))
    }

    /// Record a successful attempt so the next directory gets a new number.
    pub fn succeeded(&mut self, format: &str, dir: &ScratchDir) {
        self.counters.insert(format.to_string(), dir.index + 1);
    }

    /// Remove a failed attempt's directory and anything written into it.
    pub fn discard(&self, dir: ScratchDir) {
        if let Err(err) = std::fs::remove_dir_all(&dir.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!("could not remove {}: {err}", dir.path.display());
            }
        }
    }
}

/// A carved byte range (or a link to the whole input) in a private temporary
/// directory.
#[derive(Debug)]
pub struct ScratchFile {
    _dir: TempDir,
    path: PathBuf,
}

impl ScratchFile {
    /// Copy `[offset, offset + len)` of `source` into a new file called
    /// `name` under `root`. When the range is the whole file and `origin` is
    /// given, a hard link is tried before copying.
    pub fn carve(
        source: &dyn ByteSource,
        origin: Option<&Path>,
        offset: u64,
        len: u64,
        root: &Path,
        name: &str,
    ) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(".firmcarve-").tempdir_in(root)?;
        let path = dir.path().join(name);
        if let Some(origin) = origin.filter(|_| offset == 0 && len == source.len()) {
            if std::fs::hard_link(origin, &path).is_ok() {
                return Ok(Self { _dir: dir, path });
            }
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        let mut reader = SourceReader::new(source, offset, offset.saturating_add(len));
        let copied = std::io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        if copied != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("carved {copied} of {len} bytes at offset {offset}"),
            ));
        }
        Ok(Self { _dir: dir, path })
    }

    /// Write `bytes` into a new scratch file, for headers patched in memory.
    pub fn from_bytes(bytes: &[u8], root: &Path, name: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(".firmcarve-").tempdir_in(root)?;
        let path = dir.path().join(name);
        std::fs::write(&path, bytes)?;
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the scratch file, usable for tool side outputs.
    pub fn dir(&self) -> &Path {
        self._dir.path()
    }
}

/// Length to carve when a format's header does not say: up to the next
/// claimed range or the end of the file.
pub fn unclaimed_span(blacklist: &Blacklist, offset: u64, file_len: u64) -> u64 {
    blacklist
        .next_claimed_after(offset)
        .unwrap_or(file_len)
        .min(file_len)
        .saturating_sub(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_names_count_successes() {
        let root = tempfile::tempdir().expect("tempdir");
        let input = root.path().join("fw.bin");
        std::fs::write(&input, b"x").expect("write");
        let mut space = ScratchSpace::for_file(&input);

        let first = space.create_dir("gzip").expect("dir");
        assert_eq!(first.path, root.path().join("fw.bin-gzip-1"));
        space.discard(first);
        assert!(!root.path().join("fw.bin-gzip-1").exists());

        let again = space.create_dir("gzip").expect("dir");
        assert_eq!(again.path, root.path().join("fw.bin-gzip-1"));
        space.succeeded("gzip", &again);
        let next = space.create_dir("gzip").expect("dir");
        assert_eq!(next.path, root.path().join("fw.bin-gzip-2"));
        let other = space.create_dir("tar").expect("dir");
        assert_eq!(other.path, root.path().join("fw.bin-tar-1"));
    }

    #[test]
    fn existing_names_are_skipped() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join("a-xz-1")).expect("mkdir");
        let space = ScratchSpace::for_file(&root.path().join("a"));
        let dir = space.create_dir("xz").expect("dir");
        assert_eq!(dir.path, root.path().join("a-xz-2"));
    }

    #[test]
    fn carve_copies_range_and_cleans_up() {
        let root = tempfile::tempdir().expect("tempdir");
        let data = b"0123456789".to_vec();
        let scratch = ScratchFile::carve(&data, None, 2, 5, root.path(), "part").expect("carve");
        assert_eq!(std::fs::read(scratch.path()).expect("read"), b"23456");
        let dir = scratch.dir().to_path_buf();
        drop(scratch);
        assert!(!dir.exists());

        let short = ScratchFile::carve(&data, None, 8, 5, root.path(), "part");
        assert!(short.is_err());
    }

    #[test]
    fn whole_file_uses_link() {
        let root = tempfile::tempdir().expect("tempdir");
        let input = root.path().join("whole");
        std::fs::write(&input, b"abc").expect("write");
        let data = b"abc".to_vec();
        let scratch =
            ScratchFile::carve(&data, Some(&input), 0, 3, root.path(), "whole").expect("carve");
        assert_eq!(std::fs::read(scratch.path()).expect("read"), b"abc");
    }

    #[test]
    fn unclaimed_span_stops_at_next_claim() {
        let mut blacklist = Blacklist::new();
        blacklist.add(50, 60);
        assert_eq!(unclaimed_span(&blacklist, 10, 100), 40);
        assert_eq!(unclaimed_span(&blacklist, 60, 100), 40);
    }
}

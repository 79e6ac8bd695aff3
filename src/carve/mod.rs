//! Per-format carving drivers.
//!
//! A driver names the markers it starts from, validates a candidate offset
//! with a cheap header check and, when that passes, extracts the format into
//! a directory it is handed. The engine owns the candidate loop, the
//! blacklist and directory cleanup; drivers only report the consumed length.

pub mod bzip2;
pub mod copy;
pub mod cpio;
pub mod ext2;
pub mod filesystem;
pub mod flash;
pub mod gzip;
pub mod pdf;
pub mod rar;
pub mod sevenz;
pub mod squashfs;
pub mod streams;
pub mod tar;
pub mod transform;
pub mod xz;
pub mod zip;

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::blacklist::Blacklist;
use crate::config::{Config, ScanOptions};
use crate::scanner::OffsetTable;
use crate::scratch::{ScratchFile, ScratchSpace, unclaimed_span};
use crate::source::ByteSource;
use crate::tool::{Invocation, Outcome, OutcomeTable, ToolBox, ToolError, ToolOutput};

#[derive(Debug, Error)]
pub enum CarveError {
    /// Not this format after all, or the decoder rejected the data.
    #[error("not recognised")]
    ExpectedMiss,
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),
    /// The tool reported success but its output cannot be trusted.
    #[error("corrupt partial output: {0}")]
    CorruptPartialOutput(String),
    #[error("scratch allocation failed: {0}")]
    ResourceExhaustion(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ToolError> for CarveError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound(program) => CarveError::ToolUnavailable(program),
            ToolError::Io { source, .. } => CarveError::Io(source),
        }
    }
}

/// Successful extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Carved {
    /// Bytes consumed from the candidate offset; 0 when unknown.
    pub length: u64,
    /// Extra tags, e.g. the squashfs variant that worked.
    pub tags: Vec<String>,
}

impl Carved {
    pub fn length(length: u64) -> Self {
        Self {
            length,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Everything a driver may look at while checking or carving one file.
pub struct CarveContext<'a> {
    pub path: &'a Path,
    pub source: &'a dyn ByteSource,
    pub table: &'a OffsetTable,
    pub blacklist: &'a Blacklist,
    pub options: &'a ScanOptions,
    pub tools: &'a ToolBox,
    pub scratch: &'a ScratchSpace,
}

impl CarveContext<'_> {
    pub fn file_len(&self) -> u64 {
        self.source.len()
    }

    pub fn basename(&self) -> &str {
        self.scratch.basename()
    }

    /// Bytes from `offset` up to the next claimed range or EOF.
    pub fn unclaimed_span(&self, offset: u64) -> u64 {
        unclaimed_span(self.blacklist, offset, self.file_len())
    }

    /// Where temporary copies for `format` are written.
    pub fn scratch_root(&self, format: &str) -> &Path {
        self.options
            .tmpdir_for(format)
            .unwrap_or_else(|| self.scratch.parent())
    }

    /// Copy `[offset, offset + len)` into a scratch file named after the input.
    pub fn carve_range(&self, format: &str, offset: u64, len: u64) -> Result<ScratchFile, CarveError> {
        ScratchFile::carve(
            self.source,
            Some(self.path),
            offset,
            len,
            self.scratch_root(format),
            self.basename(),
        )
        .map_err(CarveError::ResourceExhaustion)
    }

    /// Run a tool and classify the result with `table`. Anything but a clean
    /// success becomes an error.
    pub fn run_tool(&self, invocation: &Invocation, table: &OutcomeTable) -> Result<ToolOutput, CarveError> {
        let output = self.tools.run(invocation)?;
        match table.classify(&output) {
            Outcome::Success => Ok(output),
            Outcome::FalseSuccess => Err(CarveError::CorruptPartialOutput(format!(
                "{}: {}",
                invocation.program,
                output.stderr_text().lines().next().unwrap_or("")
            ))),
            Outcome::Failure => Err(CarveError::ExpectedMiss),
        }
    }

    /// Run a helper whose output is parsed rather than judged (`tune2fs -l`,
    /// `file`, listings). `None` on any failure.
    pub fn describe(&self, invocation: &Invocation) -> Option<ToolOutput> {
        match self.tools.run(invocation) {
            Ok(output) if output.success() => Some(output),
            Ok(_) => None,
            Err(err) => {
                debug!("{} unavailable: {err}", invocation.program);
                None
            }
        }
    }

    /// Output name for a decompressed stream that carries no name of its own.
    pub fn stream_output_name(&self) -> String {
        self.options
            .template_name(self.basename())
            .unwrap_or_else(|| format!("{}.out", self.basename()))
    }
}

pub trait FormatDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Marker ids (from the marker table) whose offsets are candidates.
    fn markers(&self) -> &'static [&'static str];

    /// Distance from the format's start to where its marker sits.
    fn marker_correction(&self) -> u64 {
        0
    }

    /// Markers that are looked up by `check` but are not start offsets.
    fn auxiliary_markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &[]
    }

    /// At least one of these must be present.
    fn optional_tools(&self) -> &'static [&'static str] {
        &[]
    }

    /// Single-stream compressor; whole-file results tag the file `compressed`.
    fn is_compression(&self) -> bool {
        false
    }

    /// Candidate start offsets, ascending.
    fn candidates(&self, table: &OffsetTable) -> Vec<u64> {
        let correction = self.marker_correction();
        let set: BTreeSet<u64> = self
            .markers()
            .iter()
            .flat_map(|marker| table.get(marker).iter().copied())
            .filter_map(|offset| offset.checked_sub(correction))
            .collect();
        set.into_iter().collect()
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool;

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError>;
}

pub fn all_drivers() -> Vec<Box<dyn FormatDriver>> {
    vec![
        Box::new(transform::ByteSwapDriver),
        Box::new(filesystem::AndroidSparseDriver),
        Box::new(flash::UbiDriver),
        Box::new(squashfs::SquashfsDriver),
        Box::new(ext2::Ext2Driver),
        Box::new(flash::Jffs2Driver),
        Box::new(filesystem::CramfsDriver),
        Box::new(filesystem::RomfsDriver),
        Box::new(filesystem::Iso9660Driver),
        Box::new(flash::Yaffs2Driver),
        Box::new(tar::TarDriver),
        Box::new(cpio::CpioDriver),
        Box::new(zip::ZipDriver),
        Box::new(sevenz::SevenZipDriver),
        Box::new(rar::RarDriver),
        Box::new(cpio::ArDriver),
        Box::new(streams::LrzipDriver),
        Box::new(xz::XzDriver),
        Box::new(streams::LzipDriver),
        Box::new(streams::LzoDriver),
        Box::new(bzip2::Bzip2Driver),
        Box::new(gzip::GzipDriver),
        Box::new(streams::CompressDriver),
        Box::new(xz::LzmaDriver),
        Box::new(transform::SwfDriver),
        Box::new(transform::Base64Driver),
        Box::new(pdf::PdfDriver),
        Box::new(copy::PNG),
        Box::new(copy::GIF),
        Box::new(copy::DEX),
        Box::new(copy::ODEX),
        Box::new(copy::SQLITE3),
        Box::new(copy::APPLEDOUBLE),
    ]
}

pub struct RegisteredDriver {
    pub driver: Box<dyn FormatDriver>,
    pub min_size: u64,
}

/// Enabled drivers in configured priority order.
pub struct DriverRegistry {
    drivers: Vec<RegisteredDriver>,
}

impl DriverRegistry {
    pub fn from_config(cfg: &Config) -> Self {
        let mut available: Vec<Option<Box<dyn FormatDriver>>> =
            all_drivers().into_iter().map(Some).collect();
        let mut drivers = Vec::new();
        for entry in &cfg.drivers {
            let slot = available
                .iter_mut()
                .find(|d| d.as_ref().is_some_and(|d| d.name() == entry.name));
            let Some(slot) = slot else {
                warn!("unknown or duplicate driver in config: {}", entry.name);
                continue;
            };
            let Some(driver) = slot.take() else {
                continue;
            };
            if !entry.enabled {
                debug!("driver {} disabled by config", entry.name);
                continue;
            }
            drivers.push(RegisteredDriver {
                driver,
                min_size: entry.min_size,
            });
        }
        Self { drivers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredDriver> {
        self.drivers.iter()
    }

    pub fn get(&self, name: &str) -> Option<&dyn FormatDriver> {
        self.drivers
            .iter()
            .find(|d| d.driver.name() == name)
            .map(|d| d.driver.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.driver.name()).collect()
    }

    /// Every marker id any enabled driver looks at.
    pub fn marker_ids(&self) -> Vec<&'static str> {
        let set: BTreeSet<&'static str> = self
            .drivers
            .iter()
            .flat_map(|d| {
                d.driver
                    .markers()
                    .iter()
                    .chain(d.driver.auxiliary_markers())
                    .copied()
            })
            .collect();
        set.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }
}

/// Rename a single decompressed output to `name` unless that would clobber
/// something already in `dir`.
pub(crate) fn rename_output(dir: &Path, produced: &Path, name: &str) -> std::path::PathBuf {
    let target = dir.join(name);
    if target.exists() || std::fs::rename(produced, &target).is_err() {
        return produced.to_path_buf();
    }
    target
}

/// True when `dir` holds at least one entry.
pub(crate) fn has_output(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

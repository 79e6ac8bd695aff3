//! Formats that are not unpacked, only cut out of their container: images,
//! Dalvik executables, SQLite databases and AppleDouble resource forks.
//!
//! The checker yields the exact length, so the range is copied straight from
//! the source. When the format spans the whole file nothing is written; the
//! result still claims the range and tags the file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver};
use crate::checks::{checksum, structural};
use crate::source::{ByteSource, SourceReader};

type LengthCheck = fn(&dyn ByteSource, u64) -> Option<u64>;

pub struct CopyDriver {
    name: &'static str,
    markers: &'static [&'static str],
    extension: &'static str,
    length: LengthCheck,
}

pub const PNG: CopyDriver = CopyDriver {
    name: "png",
    markers: &["png"],
    extension: "png",
    length: structural::png,
};

pub const GIF: CopyDriver = CopyDriver {
    name: "gif",
    markers: &["gif87", "gif89"],
    extension: "gif",
    length: structural::gif,
};

pub const DEX: CopyDriver = CopyDriver {
    name: "dex",
    markers: &["dex"],
    extension: "dex",
    length: checksum::dex,
};

pub const ODEX: CopyDriver = CopyDriver {
    name: "odex",
    markers: &["odex"],
    extension: "odex",
    length: checksum::odex,
};

pub const SQLITE3: CopyDriver = CopyDriver {
    name: "sqlite3",
    markers: &["sqlite3"],
    extension: "sqlite3",
    length: checksum::sqlite3,
};

pub const APPLEDOUBLE: CopyDriver = CopyDriver {
    name: "appledouble",
    markers: &["appledouble"],
    extension: "appledouble",
    length: checksum::appledouble,
};

impl FormatDriver for CopyDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn markers(&self) -> &'static [&'static str] {
        self.markers
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        (self.length)(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let length = (self.length)(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        copy_out(ctx, offset, length, dir, self.extension)?;
        Ok(Carved::length(length))
    }
}

/// Copy `[offset, offset + length)` into `dir` as `<basename>.<extension>`,
/// unless that range is the whole file.
pub(crate) fn copy_out(
    ctx: &CarveContext,
    offset: u64,
    length: u64,
    dir: &Path,
    extension: &str,
) -> Result<(), CarveError> {
    if offset == 0 && length == ctx.file_len() {
        return Ok(());
    }
    let target = dir.join(format!("{}.{extension}", ctx.basename()));
    let mut writer = BufWriter::new(File::create(&target)?);
    let mut reader = SourceReader::new(ctx.source, offset, offset + length);
    let copied = std::io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    if copied != length {
        return Err(CarveError::ExpectedMiss);
    }
    Ok(())
}

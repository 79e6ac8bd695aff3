//! Read-only file system images whose superblock declares the image size:
//! cramfs, romfs, ISO 9660 and Android sparse images.

use std::ffi::OsString;
use std::path::Path;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output, sevenz};
use crate::checks::{checksum, sized};
use crate::tool::{Invocation, OutcomeTable};

/// Carve `length` bytes (or the unclaimed span when 0), run `invocation`
/// built around the scratch path and require some output.
fn extract_image(
    ctx: &CarveContext,
    format: &str,
    offset: u64,
    length: u64,
    dir: &Path,
    invocation: impl FnOnce(&Path) -> Invocation,
) -> Result<(), CarveError> {
    let span = if length == 0 {
        ctx.unclaimed_span(offset)
    } else {
        length
    };
    let scratch = ctx.carve_range(format, offset, span)?;
    ctx.run_tool(&invocation(scratch.path()), &OutcomeTable::EXIT_ZERO)?;
    if !has_output(dir) {
        return Err(CarveError::ExpectedMiss);
    }
    Ok(())
}

pub struct CramfsDriver;

impl FormatDriver for CramfsDriver {
    fn name(&self) -> &'static str {
        "cramfs"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["cramfs_le", "cramfs_be"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["fsck.cramfs"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::cramfs(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let size = sized::cramfs(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let mut extract = OsString::from("--extract=");
        extract.push(dir.join("cramfs-root"));
        extract_image(ctx, self.name(), offset, size, dir, |image| {
            Invocation::new("fsck.cramfs").arg(extract).arg(image)
        })?;
        Ok(Carved::length(size))
    }
}

pub struct RomfsDriver;

impl FormatDriver for RomfsDriver {
    fn name(&self) -> &'static str {
        "romfs"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["romfs"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["romfsck"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::romfs(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let size = sized::romfs(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let root = dir.join("romfs-root");
        extract_image(ctx, self.name(), offset, size, dir, |image| {
            Invocation::new("romfsck").arg("-d").arg(&root).arg("-b").arg(image)
        })?;
        Ok(Carved::length(size))
    }
}

pub struct Iso9660Driver;

impl FormatDriver for Iso9660Driver {
    fn name(&self) -> &'static str {
        "iso9660"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["iso9660"]
    }

    /// `CD001` follows the descriptor type byte.
    fn marker_correction(&self) -> u64 {
        sized::ISO9660_DESCRIPTOR + 1
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["7z"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::iso9660(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let size = sized::iso9660(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let scratch = ctx.carve_range(self.name(), offset, size)?;
        sevenz::extract(ctx, scratch.path(), dir)?;
        Ok(Carved::length(size))
    }
}

pub struct AndroidSparseDriver;

impl FormatDriver for AndroidSparseDriver {
    fn name(&self) -> &'static str {
        "android_sparse"
    }

    fn markers(&self) -> &'static [&'static str] {
        &["android_sparse"]
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["simg2img"]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        checksum::android_sparse(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let size = checksum::android_sparse(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let target = dir.join(format!("{}.img", ctx.basename()));
        extract_image(ctx, self.name(), offset, size, dir, |image| {
            Invocation::new("simg2img").arg(image).arg(&target)
        })?;
        Ok(Carved::length(size))
    }
}

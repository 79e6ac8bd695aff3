//! squashfs and its many vendor forks.
//!
//! One superblock magic is shared by several incompatible on-disk layouts,
//! so unpacking is a cascade: every unsquashfs build that may apply to the
//! variant is tried in turn until one succeeds. Builds that are not
//! installed are skipped; the format is only disabled when none is present.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::carve::{CarveContext, CarveError, Carved, FormatDriver, has_output};
use crate::checks::sized::{self, SquashfsSuperblock, SquashfsVariant};
use crate::scratch::ScratchFile;
use crate::source::u64_le;
use crate::tool::{ExitMatch, Invocation, Outcome, OutcomeRule, OutcomeTable};

const ROOT_NAME: &str = "squashfs-root";

/// Superblock bytes searched for the `7zip` compressor tag.
const SEVENZIP_HEAD: usize = 80;

/// Non-root runs cannot create device nodes; everything else on stderr
/// means files are missing.
const UNSQUASHFS_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::with_stderr(
            ExitMatch::Zero,
            "gzip uncompress failed with error code ",
            Outcome::FalseSuccess,
        ),
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
    ],
    benign_stderr: Some("create_inode: could not create"),
};

const BROADCOM_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::with_stderr(ExitMatch::Zero, "LzmaUncompress: error", Outcome::FalseSuccess),
        OutcomeRule::with_stderr(
            ExitMatch::Zero,
            "zlib::uncompress failed, unknown error -3",
            Outcome::FalseSuccess,
        ),
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
    ],
    benign_stderr: None,
};

const GZIP_FAILURE_OUTCOMES: OutcomeTable = OutcomeTable {
    rules: &[
        OutcomeRule::with_stderr(
            ExitMatch::Zero,
            "gzip uncompress failed with error code ",
            Outcome::FalseSuccess,
        ),
        OutcomeRule::new(ExitMatch::Zero, Outcome::Success),
    ],
    benign_stderr: None,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeSource {
    /// `file` reports `, N bytes` for layouts it understands.
    FileCommand,
    /// `-s` prints `Filesystem size N.NN Kbytes`.
    StatFlag,
    /// v3 superblock `bytes_used` at 63.
    BroadcomHeader,
    Unknown,
}

struct Flavour {
    tag: &'static str,
    program: &'static str,
    /// Flag naming the destination directory.
    dest_flag: &'static str,
    extra_args: &'static [&'static str],
    outcomes: &'static OutcomeTable,
    size: SizeSource,
    /// Crashes on images using 7zip-compressed inodes.
    avoid_7zip: bool,
    applies: fn(SquashfsVariant) -> bool,
}

fn any_variant(_: SquashfsVariant) -> bool {
    true
}

const FLAVOURS: &[Flavour] = &[
    Flavour {
        tag: "ddwrt",
        program: "unsquashfs-ddwrt",
        dest_flag: "-dest",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::Unknown,
        avoid_7zip: false,
        applies: |v| v == SquashfsVariant::DdWrt,
    },
    Flavour {
        tag: "standard",
        program: "unsquashfs",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &UNSQUASHFS_OUTCOMES,
        size: SizeSource::FileCommand,
        avoid_7zip: false,
        applies: |v| v == SquashfsVariant::Standard,
    },
    Flavour {
        tag: "4.2",
        program: "unsquashfs42",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::FileCommand,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "atheros2",
        program: "unsquashfs-atheros2",
        dest_flag: "-dest",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::FileCommand,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "openwrt",
        program: "unsquashfs-openwrt",
        dest_flag: "-dest",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::FileCommand,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "realtek",
        program: "unsquashfs-realtek",
        dest_flag: "-d",
        extra_args: &["-p", "1"],
        outcomes: &GZIP_FAILURE_OUTCOMES,
        size: SizeSource::Unknown,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "broadcom",
        program: "unsquashfs-broadcom",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &BROADCOM_OUTCOMES,
        size: SizeSource::BroadcomHeader,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "atheros",
        program: "unsquashfs-atheros",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::StatFlag,
        avoid_7zip: true,
        applies: any_variant,
    },
    Flavour {
        tag: "atheros40",
        program: "unsquashfs-atheros40",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::FileCommand,
        avoid_7zip: false,
        applies: any_variant,
    },
    Flavour {
        tag: "ralink",
        program: "unsquashfs-ralink",
        dest_flag: "-d",
        extra_args: &[],
        outcomes: &OutcomeTable::EXIT_ZERO,
        size: SizeSource::Unknown,
        avoid_7zip: true,
        applies: any_variant,
    },
];

static FILE_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r", (\d+) bytes").expect("file size pattern"));
static STAT_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^Filesystem size (\d+)(?:\.\d+)? Kbytes").expect("stat size pattern")
});

fn file_command_size(output: &str) -> Option<u64> {
    FILE_SIZE.captures(output)?[1].parse().ok()
}

fn stat_flag_size(output: &str) -> Option<u64> {
    let kib: u64 = STAT_SIZE.captures(output)?[1].parse().ok()?;
    kib.checked_mul(1024)
}

pub struct SquashfsDriver;

impl SquashfsDriver {
    fn image_len(
        &self,
        ctx: &CarveContext,
        flavour: &Flavour,
        sb: &SquashfsSuperblock,
        scratch: &Path,
        offset: u64,
    ) -> u64 {
        if let Some(used) = sb.bytes_used {
            return used;
        }
        let measured = match flavour.size {
            SizeSource::FileCommand => ctx
                .describe(&Invocation::new("file").arg("-b").arg(scratch))
                .and_then(|out| file_command_size(&out.stdout_text())),
            SizeSource::StatFlag => ctx
                .describe(&Invocation::new(flavour.program).arg("-s").arg(scratch))
                .and_then(|out| stat_flag_size(&out.stdout_text())),
            SizeSource::BroadcomHeader if sb.major == 3 => ctx
                .source
                .read_exact_at(offset + 63, 8)
                .map(|field| u64_le(&field, 0)),
            SizeSource::BroadcomHeader | SizeSource::Unknown => None,
        };
        measured
            .filter(|&len| len <= ctx.source.remaining(offset))
            .unwrap_or(0)
    }
}

impl FormatDriver for SquashfsDriver {
    fn name(&self) -> &'static str {
        "squashfs"
    }

    fn markers(&self) -> &'static [&'static str] {
        &[
            "squashfs1",
            "squashfs2",
            "squashfs3",
            "squashfs4",
            "squashfs5",
            "squashfs6",
            "squashfs7",
        ]
    }

    fn optional_tools(&self) -> &'static [&'static str] {
        &[
            "unsquashfs",
            "unsquashfs42",
            "unsquashfs-ddwrt",
            "unsquashfs-atheros",
            "unsquashfs-atheros2",
            "unsquashfs-atheros40",
            "unsquashfs-openwrt",
            "unsquashfs-realtek",
            "unsquashfs-broadcom",
            "unsquashfs-ralink",
        ]
    }

    fn check(&self, ctx: &CarveContext, offset: u64) -> bool {
        sized::squashfs(ctx.source, offset).is_some()
    }

    fn carve(&self, ctx: &CarveContext, offset: u64, dir: &Path) -> Result<Carved, CarveError> {
        let sb = sized::squashfs(ctx.source, offset).ok_or(CarveError::ExpectedMiss)?;
        let span = sb.bytes_used.unwrap_or_else(|| ctx.unclaimed_span(offset));
        let scratch = if sb.variant == SquashfsVariant::Realtek {
            // vendor magic; the realtek build only accepts the standard one
            let mut image = ctx
                .source
                .read_upto(offset, span as usize)
                .map_err(|err| CarveError::Io(std::io::Error::other(err)))?;
            let Some(magic) = image.get_mut(0..4) else {
                return Err(CarveError::ExpectedMiss);
            };
            magic.copy_from_slice(b"sqsh");
            ScratchFile::from_bytes(&image, ctx.scratch_root(self.name()), ctx.basename())
                .map_err(CarveError::ResourceExhaustion)?
        } else {
            ctx.carve_range(self.name(), offset, span)?
        };
        let head = ctx.source.read_upto(offset, SEVENZIP_HEAD).unwrap_or_default();
        let uses_7zip = head.windows(4).any(|w| w == b"7zip");

        let root = dir.join(ROOT_NAME);
        let mut last_error = CarveError::ExpectedMiss;
        for flavour in FLAVOURS {
            if !(flavour.applies)(sb.variant) || (flavour.avoid_7zip && uses_7zip) {
                continue;
            }
            if !ctx.tools.has(flavour.program) {
                continue;
            }
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            let invocation = Invocation::new(flavour.program)
                .args(flavour.extra_args)
                .arg(flavour.dest_flag)
                .arg(&root)
                .arg("-f")
                .arg(scratch.path());
            match ctx.run_tool(&invocation, flavour.outcomes) {
                Ok(_) if has_output(&root) => {
                    let length = self.image_len(ctx, flavour, &sb, scratch.path(), offset);
                    debug!("squashfs at {offset:#x} unpacked by {}", flavour.program);
                    return Ok(Carved::length(length).with_tag(format!("squashfs-{}", flavour.tag)));
                }
                Ok(_) => continue,
                Err(CarveError::ToolUnavailable(program)) => {
                    debug!("{program} vanished, trying the next flavour");
                }
                Err(err) => last_error = err,
            }
        }
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_parsers() {
        let file = "Squashfs filesystem, little endian, version 4.0, xz compressed, 4096 bytes, 12 inodes, blocksize: 131072 bytes";
        assert_eq!(file_command_size(file), Some(4096));
        let stat = "Found a valid SQUASHFS superblock\nFilesystem size 118.25 Kbytes (0.12 Mbytes)\n";
        assert_eq!(stat_flag_size(stat), Some(118 * 1024));
        assert_eq!(stat_flag_size("nothing"), None);
    }

    #[test]
    fn cascade_order_puts_vendor_magic_first() {
        let ddwrt: Vec<&str> = FLAVOURS
            .iter()
            .filter(|f| (f.applies)(SquashfsVariant::DdWrt))
            .map(|f| f.tag)
            .collect();
        assert_eq!(ddwrt.first(), Some(&"ddwrt"));
        assert!(!ddwrt.contains(&"standard"));

        let standard: Vec<&str> = FLAVOURS
            .iter()
            .filter(|f| (f.applies)(SquashfsVariant::Standard))
            .map(|f| f.tag)
            .collect();
        assert_eq!(standard.first(), Some(&"standard"));
        assert_eq!(standard.last(), Some(&"ralink"));
    }
}

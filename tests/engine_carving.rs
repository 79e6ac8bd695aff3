mod common;

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use firmcarve::blacklist::ByteInterval;
use firmcarve::checks::checksum::JFFS2_MAGIC;
use firmcarve::checks::jffs2_crc32;
use firmcarve::tool::{Capture, Invocation, ToolError, ToolOutput, ToolRunner};

use common::{CountingRunner, config_with, engine_with, system_engine, write_file};

#[test]
fn whole_file_gzip_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plaintext = b"kernel command line: console=ttyS0,115200 root=/dev/mtdblock2".repeat(20);
    let member = common::gzip(&plaintext);
    let input = write_file(dir.path(), "vmlinux.gz", &member);

    let scan = system_engine(&["gzip"]).scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    let result = &scan.results[0];
    assert_eq!(result.format, "gzip");
    assert_eq!(result.offset, 0);
    assert_eq!(result.consumed_length, member.len() as u64);
    assert_eq!(scan.tags, vec!["gzip", "compressed"]);
    let out = result.directory.as_ref().expect("directory");
    assert_eq!(common::single_output(out), plaintext);
}

#[test]
fn embedded_gzip_is_carved_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let member = common::gzip(b"squashed config partition");
    let mut data = common::noise(777, 3);
    let start = data.len() as u64;
    data.extend_from_slice(&member);
    data.extend_from_slice(&common::noise(333, 9));
    let input = write_file(dir.path(), "fw.bin", &data);

    let scan = system_engine(&["gzip"]).scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    let result = &scan.results[0];
    assert_eq!(result.offset, start);
    assert_eq!(result.consumed_length, member.len() as u64);
    let end = start + member.len() as u64;
    assert_eq!(result.new_blacklist_entries, vec![ByteInterval::new(start, end)]);
    let claimed: Vec<ByteInterval> = scan.blacklist.iter().copied().collect();
    assert_eq!(claimed, vec![ByteInterval::new(start, end)]);
    assert!(scan.tags.is_empty());
}

#[test]
fn coincidental_gzip_magic_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut data = common::noise(4096, 77);
    for offset in [100usize, 1500, 3000] {
        data[offset] = 0x1f;
        data[offset + 1] = 0x8b;
        data[offset + 2] = 0x08;
    }
    let input = write_file(dir.path(), "random.bin", &data);

    let scan = system_engine(&["gzip"]).scan_file(&input).expect("scan");

    assert!(scan.results.is_empty());
    assert!(scan.blacklist.is_empty());
    let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
    assert_eq!(leftovers, 1, "failed attempts must not leave directories");
}

#[test]
fn bzip2_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plaintext = b"nvram defaults\nlan_ipaddr=192.168.1.1\n".repeat(50);
    let stream = common::bzip2(&plaintext);
    let input = write_file(dir.path(), "nvram.bz2", &stream);

    let scan = system_engine(&["bzip2"]).scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    assert_eq!(scan.results[0].consumed_length, stream.len() as u64);
    assert_eq!(scan.tags, vec!["bzip2", "compressed"]);
    let out = scan.results[0].directory.as_ref().expect("directory");
    assert_eq!(common::single_output(out), plaintext);
}

#[test]
fn claimed_offsets_never_reach_a_tool() {
    let dir = tempfile::tempdir().expect("tempdir");
    // An lzip header stored verbatim inside a gzip member, and a second one
    // after it.
    let mut inner = b"LZIP\x01\x0c".to_vec();
    inner.extend_from_slice(&[0x41; 64]);
    let member = common::gzip_stored(&inner);
    let mut data = member.clone();
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(b"LZIP\x01\x0c");
    data.extend_from_slice(&[0x42; 32]);
    let input = write_file(dir.path(), "mixed.bin", &data);

    let runner = Arc::new(CountingRunner::default());
    let engine = engine_with(&config_with(&["gzip", "lzip"]), runner.clone());
    let scan = engine.scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    assert_eq!(scan.results[0].format, "gzip");
    assert_eq!(runner.calls(), 1);
    assert_eq!(runner.programs(), vec!["lzip"]);

    // Scanning the same file again behaves identically.
    let again = engine.scan_file(&input).expect("rescan");
    assert_eq!(again.results.len(), 1);
    assert_eq!(runner.calls(), 2);
}

fn jffs2_node(corrupt_crc: bool) -> Vec<u8> {
    let mut node = Vec::new();
    node.extend_from_slice(&JFFS2_MAGIC.to_le_bytes());
    node.extend_from_slice(&0x2003u16.to_le_bytes());
    node.extend_from_slice(&64u32.to_le_bytes());
    let mut crc = jffs2_crc32(&node);
    if corrupt_crc {
        crc ^= 1;
    }
    node.extend_from_slice(&crc.to_le_bytes());
    node.resize(64, 0x33);
    node
}

#[test]
fn jffs2_with_corrupt_crc_never_runs_the_tool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut data = vec![0xffu8; 256];
    data.extend_from_slice(&jffs2_node(true));
    data.extend_from_slice(&[0xff; 128]);
    let input = write_file(dir.path(), "flash.bin", &data);

    let runner = Arc::new(CountingRunner::default());
    let engine = engine_with(&config_with(&["jffs2"]), runner.clone());
    let scan = engine.scan_file(&input).expect("scan");

    assert!(scan.results.is_empty());
    assert_eq!(runner.calls(), 0);
}

#[test]
fn jffs2_with_valid_crc_reaches_the_tool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut data = vec![0xffu8; 256];
    data.extend_from_slice(&jffs2_node(false));
    data.extend_from_slice(&[0xff; 128]);
    let input = write_file(dir.path(), "flash.bin", &data);

    let runner = Arc::new(CountingRunner::default());
    let engine = engine_with(&config_with(&["jffs2"]), runner.clone());
    let scan = engine.scan_file(&input).expect("scan");

    // the mock fails every run, so nothing is claimed
    assert!(scan.results.is_empty());
    assert_eq!(runner.programs(), vec!["jefferson"]);
}

#[test]
fn disabled_format_is_not_attempted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_file(dir.path(), "x.lz", b"LZIP\x01\x0c0123456789abcdef");

    let runner = Arc::new(MissingTools);
    let engine = engine_with(&config_with(&["lzip"]), runner);
    assert_eq!(engine.tools().disabled_formats(), vec!["lzip"]);
    let scan = engine.scan_file(&input).expect("scan");
    assert!(scan.results.is_empty());
}

struct MissingTools;

impl ToolRunner for MissingTools {
    fn locate(&self, _program: &str) -> bool {
        false
    }

    fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ToolOutput, ToolError> {
        panic!("{} should never run", invocation.program);
    }
}

/// Every tool is present at preflight and gone by the time it runs.
#[derive(Default)]
struct VanishingTools {
    runs: AtomicUsize,
}

impl ToolRunner for VanishingTools {
    fn locate(&self, _program: &str) -> bool {
        true
    }

    fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ToolOutput, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::NotFound(invocation.program.clone()))
    }
}

fn two_lzip_headers() -> Vec<u8> {
    let mut data = b"LZIP\x01\x0c".to_vec();
    data.resize(64, 0x41);
    data.extend_from_slice(b"LZIP\x01\x0c");
    data.resize(128, 0x42);
    data
}

#[test]
fn tool_vanishing_mid_run_disables_the_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_file(dir.path(), "two.lz", &two_lzip_headers());

    let runner = Arc::new(VanishingTools::default());
    let engine = engine_with(&config_with(&["lzip"]), runner.clone());
    assert!(engine.tools().disabled_formats().is_empty());

    let scan = engine.scan_file(&input).expect("scan");
    assert!(scan.results.is_empty());
    assert!(scan.blacklist.is_empty());
    assert_eq!(engine.tools().disabled_formats(), vec!["lzip"]);
    // the second candidate is skipped once the format is disabled
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    engine.scan_file(&input).expect("rescan");
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
}

/// Writes some output, then reports being killed at the deadline with a
/// zero exit status.
struct TimedOutTools;

impl ToolRunner for TimedOutTools {
    fn locate(&self, _program: &str) -> bool {
        true
    }

    fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ToolOutput, ToolError> {
        if let Capture::File(target) = &invocation.stdout {
            std::fs::write(target, b"partial").expect("partial output");
        }
        Ok(ToolOutput {
            status: Some(0),
            timed_out: true,
            ..ToolOutput::default()
        })
    }
}

#[test]
fn timed_out_tool_leaves_no_claim_and_no_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_file(dir.path(), "slow.lz", &two_lzip_headers());

    let engine = engine_with(&config_with(&["lzip"]), Arc::new(TimedOutTools));
    let scan = engine.scan_file(&input).expect("scan");

    assert!(scan.results.is_empty());
    assert!(scan.blacklist.is_empty());
    assert!(engine.tools().disabled_formats().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .map(|e| e.expect("entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("slow.lz")]);
}

#[test]
fn realtek_superblock_smaller_than_its_header_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut data = vec![0u8; 64];
    data[0..4].copy_from_slice(b"sqlz");
    data[28..30].copy_from_slice(&4u16.to_le_bytes());
    data[40..48].copy_from_slice(&2u64.to_le_bytes());
    let input = write_file(dir.path(), "tiny.sqfs", &data);

    let runner = Arc::new(CountingRunner::default());
    let engine = engine_with(&config_with(&["squashfs"]), runner.clone());
    let scan = engine.scan_file(&input).expect("scan");

    assert!(scan.results.is_empty());
    assert_eq!(runner.calls(), 0);
}

#[test]
fn compressed_flash_movie_is_inflated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let body = b"\x78\x00\x05\x5f\x00\x00\x0f\xa0\x00\x00\x18\x01\x00".repeat(40);
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&body).expect("write");
    let mut movie = b"CWS\x0a".to_vec();
    movie.extend_from_slice(&(body.len() as u32 + 8).to_le_bytes());
    movie.extend_from_slice(&encoder.finish().expect("finish"));
    let input = write_file(dir.path(), "intro.swf", &movie);

    let scan = system_engine(&["swf"]).scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    assert_eq!(scan.results[0].consumed_length, movie.len() as u64);
    assert_eq!(scan.tags, vec!["swf"]);
    let out = scan.results[0].directory.as_ref().expect("directory");
    assert_eq!(common::single_output(out), body);
}

#[test]
fn byteswapped_dump_is_restored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut plain = b"Uncompressing Linux...".to_vec();
    plain.extend_from_slice(&common::noise(1000, 4));
    let swapped: Vec<u8> = plain.chunks(2).flat_map(|pair| [pair[1], pair[0]]).collect();
    let input = write_file(dir.path(), "nor.bin", &swapped);

    let scan = system_engine(&["byteswap"]).scan_file(&input).expect("scan");

    assert_eq!(scan.results.len(), 1);
    assert_eq!(scan.results[0].consumed_length, swapped.len() as u64);
    assert_eq!(scan.tags, vec!["byteswap"]);
    let out = scan.results[0].directory.as_ref().expect("directory");
    assert_eq!(common::single_output(out), plain);

    // the restored image carries the banner unswapped and is left alone
    let again = system_engine(&["byteswap"]).scan_file(&out.join("nor.bin.swapped")).expect("rescan");
    assert!(again.results.is_empty());
}

//! # Pipeline Module
//!
//! Orchestrates one run: stage the input under `<run>/unpack/`, scan it and
//! everything unpacked from it on a worker pool, and record one metadata
//! line per file followed by the run summary.

pub mod events;
pub mod workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::unbounded;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::metadata::{MetadataSink, RunSummary};

use events::MetadataEvent;
use workers::{SharedState, UnpackJob};

/// Pipeline statistics collected during a run
#[derive(Debug, Clone)]
pub struct RunStats {
    pub files_scanned: u64,
    pub bytes_scanned: u64,
    pub unpacks: u64,
    pub duplicates: u64,
    pub unreadable: u64,
    pub metadata_errors: u64,
    pub cancelled: bool,
    /// Where the staged input and everything unpacked from it lives.
    pub unpack_root: PathBuf,
}

/// Hard-link `input` into `unpack_dir`, copying when linking fails (for
/// example across file systems).
pub fn stage_input(input: &Path, unpack_dir: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(input)
        .with_context(|| format!("cannot stat input {}", input.display()))?;
    if !meta.is_file() {
        return Err(anyhow!("input {} is not a regular file", input.display()));
    }
    let name = input
        .file_name()
        .ok_or_else(|| anyhow!("input {} has no file name", input.display()))?;
    std::fs::create_dir_all(unpack_dir)
        .with_context(|| format!("cannot create {}", unpack_dir.display()))?;
    let staged = unpack_dir.join(name);
    if std::fs::hard_link(input, &staged).is_err() {
        std::fs::copy(input, &staged)
            .with_context(|| format!("cannot copy input to {}", staged.display()))?;
    }
    Ok(staged)
}

/// Run the recursive unpack over `input`.
pub fn run_pipeline(
    cfg: &Config,
    input: &Path,
    run_output_dir: &Path,
    engine: Arc<Engine>,
    meta_sink: Box<dyn MetadataSink>,
    workers: usize,
    cancel_flag: Arc<AtomicBool>,
) -> Result<RunStats> {
    let start_time = Instant::now();
    let unpack_root = run_output_dir.join("unpack");
    let staged = stage_input(input, &unpack_root)?;
    info!(
        "staged {} drivers={} workers={}",
        staged.display(),
        engine.registry().len(),
        workers
    );

    let (job_tx, job_rx) = unbounded::<UnpackJob>();
    let (meta_tx, meta_rx) = unbounded::<MetadataEvent>();
    let metadata_errors = Arc::new(AtomicU64::new(0));
    let meta_handle = workers::spawn_metadata_thread(meta_sink, meta_rx, metadata_errors.clone());

    let state = Arc::new(SharedState::new(
        &cfg.run_id,
        &unpack_root,
        cfg.max_depth,
        cancel_flag.clone(),
    ));
    workers::enqueue(&job_tx, &state, UnpackJob { path: staged, depth: 0 });
    let handles = workers::spawn_unpack_workers(
        workers,
        engine.clone(),
        state.clone(),
        job_tx.clone(),
        job_rx,
        meta_tx.clone(),
    );
    drop(job_tx);

    for handle in handles {
        if handle.join().is_err() {
            warn!("unpack worker panicked");
        }
    }

    let cancelled = cancel_flag.load(Ordering::Relaxed);
    let summary = RunSummary {
        run_id: cfg.run_id.clone(),
        files_scanned: state.files_scanned.load(Ordering::Relaxed),
        bytes_scanned: state.bytes_scanned.load(Ordering::Relaxed),
        unpacks: state.unpacks.load(Ordering::Relaxed),
        duplicates: state.duplicates.load(Ordering::Relaxed),
        unreadable: state.unreadable.load(Ordering::Relaxed),
        disabled_formats: engine.tools().disabled_formats(),
        cancelled,
    };
    if let Err(err) = meta_tx.send(MetadataEvent::RunSummary(summary.clone())) {
        warn!("metadata channel closed while sending run summary: {err}");
    }
    drop(meta_tx);
    let _ = meta_handle.join();

    if cancelled {
        info!("shutdown requested; stopping early");
    }

    let stats = RunStats {
        files_scanned: summary.files_scanned,
        bytes_scanned: summary.bytes_scanned,
        unpacks: summary.unpacks,
        duplicates: summary.duplicates,
        unreadable: summary.unreadable,
        metadata_errors: metadata_errors.load(Ordering::Relaxed),
        cancelled,
        unpack_root,
    };

    info!(
        "run_summary files_scanned={} bytes_scanned={} unpacks={} duplicates={} unreadable={} elapsed_secs={:.2}",
        stats.files_scanned,
        stats.bytes_scanned,
        stats.unpacks,
        stats.duplicates,
        stats.unreadable,
        start_time.elapsed().as_secs_f64()
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_links_or_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("image.bin");
        std::fs::write(&input, b"firmware").expect("write");
        let staged = stage_input(&input, &dir.path().join("run/unpack")).expect("stage");
        assert_eq!(staged, dir.path().join("run/unpack/image.bin"));
        assert_eq!(std::fs::read(&staged).expect("read"), b"firmware");
    }

    #[test]
    fn staging_rejects_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = stage_input(dir.path(), &dir.path().join("unpack")).expect_err("dir");
        assert!(err.to_string().contains("not a regular file"));
    }
}

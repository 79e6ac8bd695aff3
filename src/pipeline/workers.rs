//! # Pipeline Workers
//!
//! The metadata thread and the unpack worker pool. Workers pull files from
//! a shared frontier, scan them with the [`Engine`] and push every regular
//! file found in the produced directories back onto the frontier.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::engine::Engine;
use crate::metadata::{ChildRecord, FileRecord, MetadataSink};
use crate::util::normalize_permissions;

use super::events::MetadataEvent;

const HASH_BUF_SIZE: usize = 64 * 1024;
const IDLE_POLL: Duration = Duration::from_millis(50);

/// A file waiting to be scanned.
pub struct UnpackJob {
    pub path: PathBuf,
    pub depth: u32,
}

/// Counters and state shared by all workers of one run.
pub struct SharedState {
    pub run_id: String,
    pub unpack_root: PathBuf,
    pub max_depth: Option<u32>,
    pub cancel: Arc<AtomicBool>,
    /// Jobs enqueued but not yet finished; the run is over when it hits 0.
    pub pending: AtomicUsize,
    pub seen: Mutex<HashSet<String>>,
    pub files_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub unpacks: AtomicU64,
    pub duplicates: AtomicU64,
    pub unreadable: AtomicU64,
}

impl SharedState {
    pub fn new(run_id: &str, unpack_root: &Path, max_depth: Option<u32>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            run_id: run_id.to_string(),
            unpack_root: unpack_root.to_path_buf(),
            max_depth,
            cancel,
            pending: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
            files_scanned: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            unpacks: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            unreadable: AtomicU64::new(0),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Path relative to the unpack root, for records.
    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.unpack_root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// First sighting of a digest in this run.
    fn first_sighting(&self, sha256: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(sha256.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(sha256.to_string()),
        }
    }
}

/// Queue a job, counting it as pending before it becomes visible.
pub fn enqueue(tx: &Sender<UnpackJob>, state: &SharedState, job: UnpackJob) {
    state.pending.fetch_add(1, Ordering::SeqCst);
    if let Err(err) = tx.send(job) {
        state.pending.fetch_sub(1, Ordering::SeqCst);
        warn!("frontier closed, dropping {}", err.0.path.display());
    }
}

/// Spawn the metadata recording thread
pub fn spawn_metadata_thread(
    sink: Box<dyn MetadataSink>,
    rx: Receiver<MetadataEvent>,
    error_count: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            let result = match event {
                MetadataEvent::File(record) => sink.record_file(&record),
                MetadataEvent::RunSummary(summary) => sink.record_run_summary(&summary),
            };
            if let Err(err) = result {
                error_count.fetch_add(1, Ordering::Relaxed);
                warn!("metadata record error: {err}");
            }
        }
        if let Err(err) = sink.flush() {
            error_count.fetch_add(1, Ordering::Relaxed);
            warn!("metadata flush error: {err}");
        }
    })
}

/// Spawn unpack worker threads. Each worker exits once the frontier is
/// drained and nothing is pending, or when the run is cancelled.
pub fn spawn_unpack_workers(
    workers: usize,
    engine: Arc<Engine>,
    state: Arc<SharedState>,
    job_tx: Sender<UnpackJob>,
    job_rx: Receiver<UnpackJob>,
    meta_tx: Sender<MetadataEvent>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::new();
    let worker_count = workers.max(1);

    for _ in 0..worker_count {
        let engine = engine.clone();
        let state = state.clone();
        let job_tx = job_tx.clone();
        let job_rx = job_rx.clone();
        let meta_tx = meta_tx.clone();

        handles.push(thread::spawn(move || {
            loop {
                if state.cancelled() {
                    break;
                }
                let job = match job_rx.recv_timeout(IDLE_POLL) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => {
                        if state.pending.load(Ordering::SeqCst) == 0 {
                            break;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let record = finish_job(&state, &job, || process_job(&engine, &state, &job_tx, &job));
                if let Some(record) = record {
                    if let Err(err) = meta_tx.send(MetadataEvent::File(record)) {
                        warn!("metadata channel closed while sending file record: {err}");
                    }
                }
            }
        }));
    }

    handles
}

/// Releases one pending job when dropped, unwinding included.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run `scan` for a dequeued job. The job stops being pending however `scan`
/// ends; a panic skips the file and counts it as unreadable.
fn finish_job<F>(state: &SharedState, job: &UnpackJob, scan: F) -> Option<FileRecord>
where
    F: FnOnce() -> Option<FileRecord>,
{
    let _pending = PendingGuard(&state.pending);
    match panic::catch_unwind(AssertUnwindSafe(scan)) {
        Ok(record) => record,
        Err(_) => {
            state.unreadable.fetch_add(1, Ordering::Relaxed);
            warn!("{}: scan aborted by a panic, file skipped", job.path.display());
            None
        }
    }
}

/// Scan one file and queue whatever came out of it.
fn process_job(
    engine: &Engine,
    state: &SharedState,
    job_tx: &Sender<UnpackJob>,
    job: &UnpackJob,
) -> Option<FileRecord> {
    let path = &job.path;
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            state.unreadable.fetch_add(1, Ordering::Relaxed);
            warn!("cannot stat {}: {err}", path.display());
            return None;
        }
    };
    if !meta.file_type().is_file() {
        debug!("skipping non-regular file {}", path.display());
        return None;
    }

    let (sha256, md5) = match hash_file(path) {
        Ok(digests) => digests,
        Err(err) => {
            state.unreadable.fetch_add(1, Ordering::Relaxed);
            warn!("cannot read {}: {err}", path.display());
            return None;
        }
    };
    let mut record = FileRecord {
        run_id: state.run_id.clone(),
        path: state.relative(path),
        sha256,
        md5,
        size: meta.len(),
        tags: Vec::new(),
        children: Vec::new(),
    };

    if meta.len() == 0 {
        record.tags.push("empty".to_string());
        return Some(record);
    }
    if !state.first_sighting(&record.sha256) {
        state.duplicates.fetch_add(1, Ordering::Relaxed);
        record.tags.push("duplicate".to_string());
        return Some(record);
    }

    let scan = match engine.scan_file(path) {
        Ok(scan) => scan,
        Err(err) => {
            state.unreadable.fetch_add(1, Ordering::Relaxed);
            warn!("{err}");
            return Some(record);
        }
    };
    state.files_scanned.fetch_add(1, Ordering::Relaxed);
    state.bytes_scanned.fetch_add(meta.len(), Ordering::Relaxed);
    state
        .unpacks
        .fetch_add(scan.results.len() as u64, Ordering::Relaxed);
    record.tags = scan.tags;

    let descend = state.max_depth.is_none_or(|max| job.depth < max);
    for result in scan.results {
        if let Some(dir) = &result.directory {
            if descend && !state.cancelled() {
                normalize_permissions(dir);
                queue_directory(dir, job.depth + 1, state, job_tx);
            }
        }
        record.children.push(ChildRecord {
            directory: result.directory.as_deref().map(|d| state.relative(d)),
            offset: result.offset,
            consumed_length: result.consumed_length,
            format: result.format,
        });
    }
    Some(record)
}

/// Queue every regular file below `dir`. Symlinks are not followed.
fn queue_directory(dir: &Path, depth: u32, state: &SharedState, job_tx: &Sender<UnpackJob>) {
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => enqueue(
                job_tx,
                state,
                UnpackJob {
                    path: entry.into_path(),
                    depth,
                },
            ),
            Ok(_) => {}
            Err(err) => debug!("walk error under {}: {err}", dir.display()),
        }
    }
}

/// sha256 and md5 of a file, hex encoded.
pub fn hash_file(path: &Path) -> std::io::Result<(String, String)> {
    let mut file = File::open(path)?;
    let mut sha = Sha256::new();
    let mut md5 = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        sha.update(&buf[..read]);
        md5.consume(&buf[..read]);
    }
    Ok((hex::encode(sha.finalize()), format!("{:x}", md5.compute())))
}

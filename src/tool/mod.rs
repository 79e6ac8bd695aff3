//! External unpacker invocation.
//!
//! Every decoder that is not implemented in-process runs as a child process
//! through a [`ToolRunner`]. The system runner places the child in its own
//! process group, captures stdout/stderr into files so that large outputs
//! never sit in pipes, and kills the whole group on timeout or cancellation.

pub mod outcome;

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub use outcome::{ExitMatch, Outcome, OutcomeRule, OutcomeTable};

/// Captured output is truncated beyond this many bytes.
pub const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("io error running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a tool's standard output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Kept for inspection, truncated to [`MAX_CAPTURE_BYTES`].
    Memory,
    /// Streamed straight into the file (decompressors writing to stdout).
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub stdout: Capture,
    pub stdin_file: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            stdout: Capture::Memory,
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Capture::File(path.to_path_buf());
        self
    }

    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0) && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait ToolRunner: Send + Sync {
    /// Whether `program` can be executed.
    fn locate(&self, program: &str) -> bool;
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as real child processes.
pub struct SystemToolRunner {
    cancel: Arc<AtomicBool>,
}

impl SystemToolRunner {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel }
    }
}

impl ToolRunner for SystemToolRunner {
    fn locate(&self, program: &str) -> bool {
        if program.contains('/') {
            return is_executable(Path::new(program));
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
            .unwrap_or(false)
    }

    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ToolOutput, ToolError> {
        let io_err = |source: std::io::Error| ToolError::Io {
            program: invocation.program.clone(),
            source,
        };

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        match &invocation.stdin_file {
            Some(path) => command.stdin(Stdio::from(File::open(path).map_err(io_err)?)),
            None => command.stdin(Stdio::null()),
        };
        let mut stdout_capture = None;
        match &invocation.stdout {
            Capture::File(path) => {
                command.stdout(Stdio::from(File::create(path).map_err(io_err)?));
            }
            Capture::Memory => {
                let file = tempfile::tempfile().map_err(io_err)?;
                command.stdout(Stdio::from(file.try_clone().map_err(io_err)?));
                stdout_capture = Some(file);
            }
        }
        let mut stderr_capture = tempfile::tempfile().map_err(io_err)?;
        command.stderr(Stdio::from(stderr_capture.try_clone().map_err(io_err)?));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound(invocation.program.clone()));
            }
            Err(err) => return Err(io_err(err)),
        };
        // the parent's copies of the capture handles must not keep pipes open
        drop(command);

        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    let cancelled = self.cancel.load(Ordering::Relaxed);
                    if cancelled || start.elapsed() > timeout {
                        timed_out = !cancelled;
                        debug!(
                            "killing {} after {:?} (cancelled={cancelled})",
                            invocation.program,
                            start.elapsed()
                        );
                        kill_group(&mut child);
                        break None;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    kill_group(&mut child);
                    return Err(io_err(err));
                }
            }
        };

        let stdout = match stdout_capture.as_mut() {
            Some(file) => read_capture(file).map_err(io_err)?,
            None => Vec::new(),
        };
        let stderr = read_capture(&mut stderr_capture).map_err(io_err)?;
        Ok(ToolOutput {
            status: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
        })
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        // SAFETY: signalling our own child's process group
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn read_capture(file: &mut File) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.take(MAX_CAPTURE_BYTES).read_to_end(&mut buf)?;
    Ok(buf)
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Shared, per-run view of the external tools: the runner, the timeout, tool
/// availability and the set of formats disabled because a tool is missing.
pub struct ToolBox {
    runner: Arc<dyn ToolRunner>,
    timeout: Duration,
    located: Mutex<HashMap<String, bool>>,
    disabled: Mutex<HashSet<String>>,
}

impl ToolBox {
    pub fn new(runner: Arc<dyn ToolRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            located: Mutex::new(HashMap::new()),
            disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cached [`ToolRunner::locate`].
    pub fn has(&self, program: &str) -> bool {
        let mut located = self
            .located
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *located
            .entry(program.to_string())
            .or_insert_with(|| self.runner.locate(program))
    }

    /// Check a format's tools once. Every `required` tool must exist, and at
    /// least one of `optional` when that list is not empty; otherwise the
    /// format is disabled for the run.
    pub fn preflight(&self, format: &str, required: &[&str], optional: &[&str]) -> bool {
        if let Some(missing) = required.iter().find(|tool| !self.has(tool)) {
            self.disable(format, &format!("required tool {missing} not found"));
            return false;
        }
        if !optional.is_empty() && !optional.iter().any(|tool| self.has(tool)) {
            self.disable(format, &format!("none of {} found", optional.join(", ")));
            return false;
        }
        true
    }

    /// Disable `format` for the rest of the run, warning only the first time.
    pub fn disable(&self, format: &str, reason: &str) {
        let newly = self
            .disabled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(format.to_string());
        if newly {
            warn!("format {format} disabled: {reason}");
        }
    }

    pub fn is_disabled(&self, format: &str) -> bool {
        self.disabled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(format)
    }

    pub fn disabled_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .disabled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        formats.sort();
        formats
    }

    pub fn run(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        debug!("running {} {:?}", invocation.program, invocation.args);
        let result = self.runner.run(invocation, self.timeout);
        if let Err(ToolError::NotFound(program)) = &result {
            self.located
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(program.clone(), false);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SystemToolRunner {
        SystemToolRunner::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn captures_exit_status_and_streams() {
        let inv = Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = runner().run(&inv, Duration::from_secs(10)).expect("run");
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn stdout_can_stream_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("decoded");
        let inv = Invocation::new("sh")
            .args(["-c", "printf payload"])
            .stdout_to(&target);
        let out = runner().run(&inv, Duration::from_secs(10)).expect("run");
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert_eq!(std::fs::read(&target).expect("read"), b"payload");
    }

    #[test]
    fn timeout_kills_process_group() {
        let inv = Invocation::new("sh").args(["-c", "sleep 30 & sleep 30"]);
        let start = Instant::now();
        let out = runner().run(&inv, Duration::from_millis(200)).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_stops_tool() {
        let cancel = Arc::new(AtomicBool::new(true));
        let runner = SystemToolRunner::new(cancel);
        let inv = Invocation::new("sleep").arg("30");
        let out = runner.run(&inv, Duration::from_secs(60)).expect("run");
        assert_eq!(out.status, None);
        assert!(!out.timed_out);
    }

    #[test]
    fn missing_program_is_not_found() {
        let inv = Invocation::new("firmcarve-no-such-tool");
        let err = runner().run(&inv, Duration::from_secs(1)).err().expect("error");
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(!runner().locate("firmcarve-no-such-tool"));
        assert!(runner().locate("sh"));
    }

    struct NoTools;

    impl ToolRunner for NoTools {
        fn locate(&self, _program: &str) -> bool {
            false
        }

        fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ToolOutput, ToolError> {
            Err(ToolError::NotFound(invocation.program.clone()))
        }
    }

    #[test]
    fn preflight_disables_format_once() {
        let tools = ToolBox::new(Arc::new(NoTools), Duration::from_secs(1));
        assert!(tools.preflight("gzip", &[], &[]));
        assert!(!tools.preflight("xz", &["xz"], &[]));
        assert!(!tools.preflight("squashfs", &[], &["unsquashfs", "sasquatch"]));
        tools.disable("xz", "again");
        assert!(tools.is_disabled("xz"));
        assert_eq!(tools.disabled_formats(), vec!["squashfs", "xz"]);
    }
}

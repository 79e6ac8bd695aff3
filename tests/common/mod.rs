//! Shared fixtures for the integration tests: configs restricted to a few
//! drivers, in-memory compressed payloads and a tool runner that only
//! counts what it is asked to run.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use firmcarve::config::{self, Config, DriverConfig};
use firmcarve::engine::Engine;
use firmcarve::tool::{Invocation, SystemToolRunner, ToolError, ToolOutput, ToolRunner};

/// Default config with exactly `formats`, in the given order.
pub fn config_with(formats: &[&str]) -> Config {
    let mut cfg = config::load_config(None).expect("config").config;
    cfg.drivers = formats
        .iter()
        .map(|name| DriverConfig {
            name: name.to_string(),
            enabled: true,
            min_size: 0,
        })
        .collect();
    cfg
}

pub fn engine_with(cfg: &Config, runner: Arc<dyn ToolRunner>) -> Engine {
    Engine::new(cfg, runner, Arc::new(AtomicBool::new(false))).expect("engine")
}

pub fn system_engine(formats: &[&str]) -> Engine {
    let cancel = Arc::new(AtomicBool::new(false));
    let runner = Arc::new(SystemToolRunner::new(cancel.clone()));
    Engine::new(&config_with(formats), runner, cancel).expect("engine")
}

/// Claims every tool exists, records each invocation and reports failure.
#[derive(Default)]
pub struct CountingRunner {
    calls: AtomicUsize,
    programs: Mutex<Vec<String>>,
}

impl CountingRunner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn programs(&self) -> Vec<String> {
        self.programs.lock().expect("lock").clone()
    }
}

impl ToolRunner for CountingRunner {
    fn locate(&self, _program: &str) -> bool {
        true
    }

    fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.programs
            .lock()
            .expect("lock")
            .push(invocation.program.clone());
        Ok(ToolOutput {
            status: Some(1),
            ..ToolOutput::default()
        })
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    gzip_level(data, flate2::Compression::default())
}

/// Level 0 keeps the plaintext verbatim inside stored deflate blocks.
pub fn gzip_stored(data: &[u8]) -> Vec<u8> {
    gzip_level(data, flate2::Compression::none())
}

fn gzip_level(data: &[u8], level: flate2::Compression) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
    encoder.write_all(data).expect("write");
    encoder.finish().expect("finish")
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
    encoder.write_all(data).expect("write");
    encoder.finish().expect("finish")
}

/// Deterministic filler that never contains a gzip marker.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let byte = (state >> 24) as u8;
        if byte == 0x1f {
            continue;
        }
        out.push(byte);
    }
    out
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).expect("write fixture");
    path
}

/// Contents of the only file in `dir`.
pub fn single_output(dir: &Path) -> Vec<u8> {
    let entries: Vec<_> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "expected one output in {}", dir.display());
    std::fs::read(&entries[0]).expect("read output")
}

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct MarkerConfig {
    pub id: String,
    pub hex: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Files smaller than this are not offered to the driver.
    #[serde(default)]
    pub min_size: u64,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub run_id: String,
    pub window_size: u64,
    pub overlap_bytes: u64,
    pub tool_timeout_secs: u64,
    /// Nesting limit for recursion into unpacked output; unbounded when unset.
    #[serde(default)]
    pub max_depth: Option<u32>,
    pub markers: Vec<MarkerConfig>,
    pub drivers: Vec<DriverConfig>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Config {
    pub fn max_marker_len(&self) -> u64 {
        self.markers
            .iter()
            .map(|m| (m.hex.trim().len() / 2) as u64)
            .max()
            .unwrap_or(0)
    }

    /// Apply `KEY=VALUE` overrides to the option environment.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<()> {
        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got {entry:?}"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("empty key in override {entry:?}"));
            }
            self.environment
                .insert(key.to_string(), value.trim().to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }
    if config.window_size == 0 {
        return Err(anyhow!("window_size must be positive"));
    }
    let min_overlap = config.max_marker_len().saturating_sub(1);
    if config.overlap_bytes < min_overlap {
        warn!(
            "overlap_bytes={} is shorter than the longest marker; using {}",
            config.overlap_bytes, min_overlap
        );
        config.overlap_bytes = min_overlap;
    }
    if config.overlap_bytes >= config.window_size {
        return Err(anyhow!(
            "overlap_bytes {} must be smaller than window_size {}",
            config.overlap_bytes,
            config.window_size
        ));
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{:08x}", now.format("%Y%m%dT%H%M%SZ"), now.timestamp_subsec_nanos())
}

/// Typed view of the flat option environment handed to drivers.
///
/// `<FORMAT>_TMPDIR` entries are checked once here; unusable directories are
/// dropped and the format falls back to its default scratch location.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    env: BTreeMap<String, String>,
    tmpdirs: HashMap<String, PathBuf>,
}

pub const COMPRESS_MINIMUM_SIZE: &str = "COMPRESS_MINIMUM_SIZE";
pub const LZMA_MINIMUM_SIZE: &str = "LZMA_MINIMUM_SIZE";
pub const LZMA_TRY_ALL: &str = "LZMA_TRY_ALL";
pub const TEMPLATE: &str = "TEMPLATE";

impl ScanOptions {
    pub fn from_env(env: BTreeMap<String, String>) -> Self {
        let mut tmpdirs = HashMap::new();
        for (key, value) in &env {
            let Some(format) = key.strip_suffix("_TMPDIR") else {
                continue;
            };
            let dir = PathBuf::from(value);
            if usable_tmpdir(&dir) {
                tmpdirs.insert(format.to_ascii_lowercase(), dir);
            } else {
                debug!("ignoring {key}={value}: not a writable directory");
            }
        }
        Self { env, tmpdirs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("yes" | "true" | "1" | "on")
        )
    }

    /// Validated fast-storage override for `format`, if configured.
    pub fn tmpdir_for(&self, format: &str) -> Option<&Path> {
        self.tmpdirs
            .get(&format.to_ascii_lowercase())
            .map(PathBuf::as_path)
    }

    pub fn compress_minimum_size(&self) -> u64 {
        self.get_u64(COMPRESS_MINIMUM_SIZE, 1)
    }

    pub fn lzma_minimum_size(&self) -> u64 {
        self.get_u64(LZMA_MINIMUM_SIZE, 1)
    }

    pub fn lzma_try_all(&self) -> bool {
        self.flag(LZMA_TRY_ALL)
    }

    /// Output file name for a stream that carries no name of its own.
    pub fn template_name(&self, input_basename: &str) -> Option<String> {
        let template = self.get(TEMPLATE)?.trim();
        if template.is_empty() {
            return None;
        }
        let name = template.replace("%s", input_basename);
        sanitize_file_name(&name)
    }
}

fn usable_tmpdir(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let marker = dir.join(format!(".firmcarve_check_{}", std::process::id()));
    match OpenOptions::new().write(true).create(true).truncate(true).open(&marker) {
        Ok(_) => {
            let _ = std::fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}

/// Reduce a name taken from untrusted input to a single safe path component.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned)
}

//! # Utility Module
//!
//! Output directory checks, process resource limits, driver filtering and
//! permission fixes applied to unpacked trees before they are walked.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow};
#[cfg(unix)]
use tracing::info;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Config;

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }

    let check_path = path.join(".firmcarve_write_check");
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&check_path)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&check_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// Apply optional resource limits for this process. External tools inherit
/// them.
pub fn apply_resource_limits(
    max_memory_mib: Option<u64>,
    max_open_files: Option<u64>,
) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(mem_mib) = max_memory_mib {
            let bytes = mem_mib.saturating_mul(1024 * 1024);
            set_limit(libc::RLIMIT_AS, bytes, "address space")?;
        }
        if let Some(open_files) = max_open_files {
            set_limit(libc::RLIMIT_NOFILE, open_files, "open file descriptors")?;
        }
    }
    #[cfg(not(unix))]
    {
        if max_memory_mib.is_some() || max_open_files.is_some() {
            warn!("resource limits are only supported on Unix platforms");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_limit(resource: libc::__rlimit_resource_t, requested: u64, label: &str) -> Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid rlimit for getrlimit to fill in.
    if unsafe { libc::getrlimit(resource, &mut limit) } != 0 {
        return Err(anyhow!(
            "getrlimit failed for {}: {}",
            label,
            std::io::Error::last_os_error()
        ));
    }

    let requested = requested as libc::rlim_t;
    let new_cur = if requested > limit.rlim_max {
        warn!(
            "requested {} limit {} exceeds hard limit {}; using {}",
            label, requested, limit.rlim_max, limit.rlim_max
        );
        limit.rlim_max
    } else {
        requested
    };

    let new_limit = libc::rlimit {
        rlim_cur: new_cur,
        rlim_max: limit.rlim_max,
    };
    // SAFETY: `new_limit` is fully initialised and outlives the call.
    if unsafe { libc::setrlimit(resource, &new_limit) } != 0 {
        return Err(anyhow!(
            "setrlimit failed for {}: {}",
            label,
            std::io::Error::last_os_error()
        ));
    }
    info!("set {} limit to {}", label, new_cur);
    Ok(())
}

/// Keep only the drivers named in `allow_list` (case-insensitive), preserving
/// configured order. Returns the names that match no configured driver.
pub fn filter_drivers(cfg: &mut Config, allow_list: Option<&[String]>) -> Vec<String> {
    let Some(list) = allow_list else {
        return Vec::new();
    };
    let allow: HashSet<String> = list
        .iter()
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect();
    let known: HashSet<String> = cfg
        .drivers
        .iter()
        .map(|d| d.name.to_ascii_lowercase())
        .collect();

    let mut unknown: Vec<String> = allow.difference(&known).cloned().collect();
    cfg.drivers
        .retain(|d| allow.contains(&d.name.to_ascii_lowercase()));
    unknown.sort();
    unknown
}

/// Give the owner `rwx` on every directory and `rw` on every file below
/// `root` so extracted trees with odd modes can be walked and re-scanned.
/// Symlinks are left alone.
pub fn normalize_permissions(root: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                // A directory that could not be listed has had its mode
                // fixed by now; walk it again.
                Err(err) => match err.path() {
                    Some(dir) if dir != root && dir.is_dir() => {
                        normalize_permissions(dir);
                        continue;
                    }
                    _ => {
                        debug!("permission walk error under {}: {err}", root.display());
                        continue;
                    }
                },
            };
            let file_type = entry.file_type();
            let wanted = if file_type.is_dir() {
                0o700
            } else if file_type.is_file() {
                0o600
            } else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let mode = meta.permissions().mode();
            if mode & wanted != wanted {
                let perms = std::fs::Permissions::from_mode(mode | wanted);
                if let Err(err) = std::fs::set_permissions(entry.path(), perms) {
                    debug!("cannot fix mode of {}: {err}", entry.path().display());
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = root;
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_output_dir, filter_drivers, normalize_permissions};
    use crate::config;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn filters_allowed_drivers_in_config_order() {
        let loaded = config::load_config(None).expect("config");
        let mut cfg = loaded.config;
        let unknown = filter_drivers(&mut cfg, Some(&["GZIP".to_string(), "tar".to_string()]));
        assert!(unknown.is_empty());
        let names: Vec<&str> = cfg.drivers.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["tar", "gzip"]);
    }

    #[test]
    fn reports_unknown_drivers() {
        let loaded = config::load_config(None).expect("config");
        let mut cfg = loaded.config;
        let unknown = filter_drivers(&mut cfg, Some(&["gzip".to_string(), "nope".to_string()]));
        assert_eq!(unknown, vec!["nope"]);
    }

    #[test]
    fn no_allow_list_keeps_everything() {
        let loaded = config::load_config(None).expect("config");
        let mut cfg = loaded.config;
        let before = cfg.drivers.len();
        assert!(filter_drivers(&mut cfg, None).is_empty());
        assert_eq!(cfg.drivers.len(), before);
    }

    #[test]
    fn ensures_output_dir_is_writable() {
        let dir = tempdir().expect("tempdir");
        ensure_output_dir(dir.path()).expect("ensure output dir");
    }

    #[test]
    fn rejects_output_path_that_is_file() {
        let dir = tempdir().expect("tempdir");
        let file_path = dir.path().join("output.txt");
        let _ = File::create(&file_path).expect("create file");
        let err = ensure_output_dir(&file_path).expect_err("should fail");
        assert!(err.to_string().contains("not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn restores_owner_access() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("tempdir");
        let sub = dir.path().join("locked");
        std::fs::create_dir(&sub).expect("mkdir");
        let file = sub.join("data");
        std::fs::write(&file, b"x").expect("write");
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o000)).expect("chmod");
        std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o500)).expect("chmod");

        normalize_permissions(dir.path());

        let dir_mode = std::fs::metadata(&sub).expect("meta").permissions().mode();
        let file_mode = std::fs::metadata(&file).expect("meta").permissions().mode();
        assert_eq!(dir_mode & 0o700, 0o700);
        assert_eq!(file_mode & 0o600, 0o600);
    }
}

//! Utility functions for directory management and atomic file writes
//!
//! Directory layout follows the XDG Base Directory specification for unprivileged runs:
//!
//! - Config: `~/.config/portly/` - `config.json`
//! - State: `~/.local/state/portly/` - ledger and audit log
//!
//! When running as root the ledger and audit log live in the system state directory
//! instead (`/var/lib/portly` on Linux, `/usr/local/var/lib/portly` on macOS). Packagers can
//! override it at build time with `PORTLY_SYSTEM_STATE_DIR`.

use directories::ProjectDirs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the rule ledger inside the state directory
pub const LEDGER_FILE_NAME: &str = "state.json";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "portly", "portly")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

/// Per-user state directory (`$XDG_STATE_HOME/portly`).
pub fn get_user_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// System-wide state directory used when running as root.
pub fn system_state_dir() -> PathBuf {
    if let Some(dir) = option_env!("PORTLY_SYSTEM_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/var/lib/portly")
    } else {
        PathBuf::from("/var/lib/portly")
    }
}

/// State directory for the current process: system-wide for root, XDG otherwise.
pub fn get_state_dir() -> Option<PathBuf> {
    if crate::platform::is_root() {
        Some(system_state_dir())
    } else {
        get_user_state_dir()
    }
}

/// Default ledger path, `None` if no home directory can be resolved.
pub fn default_ledger_path() -> Option<PathBuf> {
    get_state_dir().map(|dir| dir.join(LEDGER_FILE_NAME))
}

/// Creates `dir` and its parents with owner-only permissions.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    ensure_dir_with_mode(dir, 0o700)
}

/// Creates `dir` and its parents with `mode` (subject to the umask).
pub fn ensure_dir_with_mode(dir: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(mode).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        std::fs::create_dir_all(dir)
    }
}

/// Directory mode for the parents of a file created with `file_mode`.
///
/// A file others may read gets traversable parents; private files get private ones.
const fn parent_dir_mode(file_mode: u32) -> u32 {
    if file_mode & 0o044 == 0 { 0o700 } else { 0o755 }
}

/// Atomically replaces `path` with `contents`.
///
/// The data is written to a temporary file in the same directory, synced, given `mode`,
/// and renamed over the target, so readers never observe a partial file. Missing parent
/// directories are created, world-readable only if `mode` is.
pub async fn write_file_atomic(path: &Path, contents: Vec<u8>, mode: u32) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_file_atomic_blocking(&path, &contents, mode))
        .await
        .map_err(std::io::Error::other)?
}

fn write_file_atomic_blocking(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.exists() {
        ensure_dir_with_mode(&parent, parent_dir_mode(mode))?;
    }

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Like [`write_file_atomic`], but an existing file keeps its permission bits.
///
/// `default_mode` only applies when `path` does not exist yet. Used for system config
/// files portly edits but does not own (`/etc/nftables.conf`, `/etc/pf.conf`).
pub async fn write_file_atomic_keep_mode(
    path: &Path,
    contents: Vec<u8>,
    default_mode: u32,
) -> std::io::Result<()> {
    let mode = match tokio::fs::metadata(path).await {
        Ok(meta) => existing_mode(&meta).unwrap_or(default_mode),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => default_mode,
        Err(e) => return Err(e),
    };
    write_file_atomic(path, contents, mode).await
}

#[cfg(unix)]
fn existing_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn existing_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

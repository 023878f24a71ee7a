//! Host detection: OS family, privileges, binaries on PATH, installed products
//!
//! Backends are offered by OS family: firewalld on `rhel`, nftables on `debian`,
//! pf on `darwin`.

use crate::core::ledger::ProductInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Operating system family
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OsFamily {
    Rhel,
    Debian,
    Darwin,
    #[default]
    Unknown,
}

/// Detected operating system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsInfo {
    pub family: OsFamily,
    pub distribution: String,
    pub version: String,
    pub codename: String,
    pub id: String,
    pub id_like: String,
}

impl OsInfo {
    pub fn is_rhel(&self) -> bool {
        self.family == OsFamily::Rhel
    }

    pub fn is_debian(&self) -> bool {
        self.family == OsFamily::Debian
    }

    pub fn is_darwin(&self) -> bool {
        self.family == OsFamily::Darwin
    }

    /// An `OsInfo` of the given family, for callers that force a backend.
    pub fn of_family(family: OsFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }
}

/// Detects the running OS. Never fails; unrecognised systems get [`OsFamily::Unknown`].
pub fn detect_os() -> OsInfo {
    if cfg!(target_os = "macos") {
        return detect_darwin();
    }
    if cfg!(target_os = "linux") {
        for path in ["/etc/os-release", "/usr/lib/os-release"] {
            if let Ok(content) = std::fs::read_to_string(path) {
                return parse_os_release(&content);
            }
        }
        debug!("No os-release file found");
    }
    OsInfo {
        distribution: std::env::consts::OS.to_string(),
        version: "unknown".to_string(),
        ..OsInfo::default()
    }
}

fn detect_darwin() -> OsInfo {
    let version = std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default();

    OsInfo {
        family: OsFamily::Darwin,
        distribution: "macos".to_string(),
        version,
        ..OsInfo::default()
    }
}

/// Parses the contents of an `os-release` file.
pub fn parse_os_release(content: &str) -> OsInfo {
    let mut info = OsInfo::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        match key.trim() {
            "ID" => info.id = value,
            "ID_LIKE" => info.id_like = value,
            "VERSION_ID" => info.version = value,
            "VERSION_CODENAME" => info.codename = value,
            _ => {}
        }
    }

    info.distribution.clone_from(&info.id);
    info.family = determine_family(&info.id, &info.id_like);
    info
}

/// Maps `ID` / `ID_LIKE` to a family.
pub fn determine_family(id: &str, id_like: &str) -> OsFamily {
    const RHEL: &[&str] = &["rhel", "fedora", "centos", "rocky", "almalinux", "ol"];
    const DEBIAN: &[&str] = &["debian", "ubuntu", "linuxmint", "mint", "pop"];

    let id = id.to_lowercase();
    let id_like = id_like.to_lowercase();
    let tokens: Vec<&str> = std::iter::once(id.as_str())
        .chain(id_like.split_whitespace())
        .collect();

    if tokens.iter().any(|t| RHEL.contains(t)) {
        OsFamily::Rhel
    } else if tokens.iter().any(|t| DEBIAN.contains(t)) {
        OsFamily::Debian
    } else {
        OsFamily::Unknown
    }
}

/// Resolves a binary name against `PATH`; absolute or relative paths are checked directly.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(name);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

/// True if `name` is an executable found on PATH (or an existing path).
pub fn command_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

/// True when running with effective UID 0.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Probes whether a product binary is installed and which version it reports.
pub fn probe_product(name: &str) -> ProductInfo {
    let Some(path) = find_binary(name) else {
        return ProductInfo {
            name: name.to_string(),
            ..ProductInfo::default()
        };
    };

    let version = std::process::Command::new(&path)
        .arg("--version")
        .output()
        .ok()
        .map(|o| {
            // Some tools (nginx) print their version on stderr
            let text = if o.stdout.is_empty() { o.stderr } else { o.stdout };
            String::from_utf8_lossy(&text)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .unwrap_or_default();

    ProductInfo {
        name: name.to_string(),
        path: path.display().to_string(),
        version,
        is_installed: true,
    }
}

use crate::drivers::BackendKind;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV: &str = "PORTLY_CONFIG";

/// Backend selection: probe the host, or force one driver
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Firewalld,
    Nftables,
    Pf,
}

impl BackendChoice {
    /// The forced backend, if any.
    pub fn forced(self) -> Option<BackendKind> {
        match self {
            BackendChoice::Auto => None,
            BackendChoice::Firewalld => Some(BackendKind::Firewalld),
            BackendChoice::Nftables => Some(BackendKind::Nftables),
            BackendChoice::Pf => Some(BackendKind::Pf),
        }
    }
}

/// Complete portly configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendChoice,
    /// Upper bound for every external command, in seconds
    #[serde(default = "default_timeout")]
    pub command_timeout_secs: u64,
    /// Ledger path override; defaults to the state directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub firewalld: FirewalldSettings,
    #[serde(default)]
    pub nftables: NftablesSettings,
    #[serde(default)]
    pub pf: PfSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            command_timeout_secs: default_timeout(),
            state_file: None,
            firewalld: FirewalldSettings::default(),
            nftables: NftablesSettings::default(),
            pf: PfSettings::default(),
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs.clamp(1, 3600))
    }

    /// Ledger location: the override if set, else the state directory default.
    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.state_file
            .clone()
            .or_else(crate::utils::default_ledger_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewalldSettings {
    /// Target zone; `None` uses firewalld's default zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Enable masquerading on the zone before forwarding
    #[serde(default = "default_true")]
    pub masquerade: bool,
}

impl Default for FirewalldSettings {
    fn default() -> Self {
        Self {
            zone: None,
            masquerade: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NftablesSettings {
    pub nat_table: String,
    pub filter_table: String,
    /// Generated fragment holding portly's tables
    pub fragment_path: PathBuf,
    /// Main config that must include the fragment
    pub main_config: PathBuf,
}

impl Default for NftablesSettings {
    fn default() -> Self {
        Self {
            nat_table: "portly_nat".to_string(),
            filter_table: "portly_filter".to_string(),
            fragment_path: PathBuf::from("/etc/nftables.d/portly.conf"),
            main_config: PathBuf::from("/etc/nftables.conf"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PfSettings {
    pub pfctl: String,
    pub pf_conf: PathBuf,
    pub anchor_dir: PathBuf,
    pub nat_anchor: String,
    pub filter_anchor: String,
}

impl Default for PfSettings {
    fn default() -> Self {
        Self {
            pfctl: "/sbin/pfctl".to_string(),
            pf_conf: PathBuf::from("/etc/pf.conf"),
            anchor_dir: PathBuf::from("/etc/pf.anchors"),
            nat_anchor: "com.portly.nat".to_string(),
            filter_anchor: "com.portly.rules".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

/// Config file location: `$PORTLY_CONFIG`, else `<config dir>/config.json`.
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .or_else(|| get_config_dir().map(|dir| dir.join("config.json")))
}

/// Saves the settings to disk atomically with mode 0o600.
///
/// # Errors
///
/// Returns `Err` if no config path can be resolved or the write fails.
pub async fn save_config(settings: &Settings) -> std::io::Result<PathBuf> {
    let path = config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "Config directory not found")
    })?;
    save_config_to(settings, &path).await?;
    Ok(path)
}

/// Saves the settings to an explicit path.
///
/// # Errors
///
/// Returns `Err` if serialization or the write fails.
pub async fn save_config_to(settings: &Settings, path: &std::path::Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    crate::utils::write_file_atomic(path, json.into_bytes(), 0o600).await
}

/// Loads the settings, or returns defaults if the file is missing or malformed.
pub async fn load_config() -> Settings {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => Settings::default(),
    }
}

/// Loads settings from an explicit path with the same fallback rules as [`load_config`].
pub async fn load_config_from(path: &std::path::Path) -> Settings {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config {}: {e}", path.display());
            }
            return Settings::default();
        }
    };

    match serde_json::from_str::<Settings>(&json) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Invalid config {}, using defaults: {e}", path.display());
            Settings::default()
        }
    }
}

use crate::core::backend::{BackendKind, BackendSettings};
use crate::core::rule::Family;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BACKEND_ENV: &str = "FWSYNC_BACKEND";
pub const IPTABLES_COMMAND_ENV: &str = "FWSYNC_IPTABLES_COMMAND";
pub const IP6TABLES_COMMAND_ENV: &str = "FWSYNC_IP6TABLES_COMMAND";
pub const NFT_COMMAND_ENV: &str = "FWSYNC_NFT_COMMAND";

const MAX_PAGE_LIMIT: u64 = 1000;

/// Persistent settings for the `fwsync` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub family: Family,
    #[serde(default = "default_iptables")]
    pub iptables_command: PathBuf,
    #[serde(default = "default_ip6tables")]
    pub ip6tables_command: PathBuf,
    #[serde(default = "default_nft")]
    pub nft_command: PathBuf,
    /// Rows per page for `list` (default: 50, clamped to 1..=1000)
    #[serde(default = "default_page_limit")]
    pub page_limit: u64,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    /// Also write logs to `<state_dir>/fwsync.log`
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            family: Family::default(),
            iptables_command: default_iptables(),
            ip6tables_command: default_ip6tables(),
            nft_command: default_nft(),
            page_limit: default_page_limit(),
            audit_enabled: true,
            log_to_file: false,
        }
    }
}

fn default_iptables() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_ip6tables() -> PathBuf {
    PathBuf::from("ip6tables")
}

fn default_nft() -> PathBuf {
    PathBuf::from("nft")
}

fn default_page_limit() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Page size actually used for listing.
    pub fn effective_page_limit(&self) -> u64 {
        self.page_limit.clamp(1, MAX_PAGE_LIMIT)
    }

    /// Applies `FWSYNC_*` overrides from `lookup`.
    ///
    /// An unparseable backend name is ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(BACKEND_ENV) {
            match value.parse::<BackendKind>() {
                Ok(kind) => self.backend = kind,
                Err(_) => tracing::warn!("Ignoring unknown {BACKEND_ENV} value '{value}'"),
            }
        }
        let paths = [
            (IPTABLES_COMMAND_ENV, &mut self.iptables_command),
            (IP6TABLES_COMMAND_ENV, &mut self.ip6tables_command),
            (NFT_COMMAND_ENV, &mut self.nft_command),
        ];
        for (var, slot) in paths {
            if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
                *slot = PathBuf::from(value);
            }
        }
    }

    pub fn to_settings(&self) -> BackendSettings {
        BackendSettings {
            kind: self.backend,
            family: self.family,
            iptables_command: self.iptables_command.clone(),
            ip6tables_command: self.ip6tables_command.clone(),
            nft_command: self.nft_command.clone(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file in the same directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    tokio::fs::create_dir_all(&dir).await?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Write;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::StorageFull {
                std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    "Disk full: cannot save configuration. Free up space and try again.",
                )
            } else {
                e.error
            }
        })?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Saves the config to the XDG config directory.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "No config directory available",
        )),
    }
}

/// Loads the config from `path`, or returns defaults if it is missing or invalid.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from the XDG config directory and applies environment overrides.
pub async fn load_config() -> AppConfig {
    let mut config = match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    };
    config.apply_overrides(|var| std::env::var(var).ok());
    config
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Steam application id of the Arma Reforger dedicated server.
pub const REFORGER_APP_ID: u32 = 1874880;

const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

/// Daemon-wide settings, read from `config/global.toml`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/servers`.
    pub instances_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/steamcmd`.
    pub steamcmd_dir: Option<PathBuf>,
    /// Override for the SteamCMD archive URL (mirrors, offline caches).
    pub steamcmd_url: Option<String>,
    pub server_executable: String,
    pub default_app_id: u32,
    pub stop_timeout_secs: u64,
    /// 0 disables the bound.
    pub install_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:57475".to_string(),
            data_dir: PathBuf::from("./data"),
            instances_dir: None,
            steamcmd_dir: None,
            steamcmd_url: None,
            server_executable: default_server_executable().to_string(),
            default_app_id: REFORGER_APP_ID,
            stop_timeout_secs: 5,
            install_timeout_secs: 3600,
            event_buffer: 1024,
        }
    }
}

fn default_server_executable() -> &'static str {
    if cfg!(target_os = "windows") {
        "ArmaReforgerServer.exe"
    } else {
        "ArmaReforgerServer"
    }
}

impl GlobalConfig {
    /// Load from `REFORGER_CONFIG` (or `config/global.toml`), then apply
    /// `REFORGER_LISTEN` / `REFORGER_DATA_DIR`. A missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("REFORGER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;

        if let Ok(addr) = std::env::var("REFORGER_LISTEN") {
            cfg.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("REFORGER_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&s).with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(cfg)
    }

    /// Config rooted at `data_dir`, everything else default. Handy for tests.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.instances_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("servers"))
    }

    pub fn steamcmd_dir(&self) -> PathBuf {
        self.steamcmd_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("steamcmd"))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn install_timeout(&self) -> Option<Duration> {
        (self.install_timeout_secs > 0).then(|| Duration::from_secs(self.install_timeout_secs))
    }
}

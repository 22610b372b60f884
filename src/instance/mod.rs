//! Instance registry: one directory per managed server under the instances
//! root, holding `config.json` and, once installed, the server files.
//!
//! The filesystem is the only durable state. The in-memory id index is
//! rebuilt from disk on startup (`reconcile`) and on every `list`.

pub mod files;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::config::REFORGER_APP_ID;
use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::utils::is_safe_id;

pub const CONFIG_FILE: &str = "config.json";
/// Written only after SteamCMD exits successfully.
pub const INSTALL_MARKER: &str = ".install-complete";
/// Folders created with every new instance.
pub const SKELETON_DIRS: [&str; 3] = ["config", "mods", "logs"];

const DEFAULT_PORT: u16 = 2302;
const DEFAULT_MAX_PLAYERS: u32 = 32;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_players() -> u32 {
    DEFAULT_MAX_PLAYERS
}

fn default_app_id() -> u32 {
    REFORGER_APP_ID
}

/// Declared configuration of one instance, persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_app_id")]
    pub steam_app_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

impl ServerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port: DEFAULT_PORT,
            max_players: DEFAULT_MAX_PLAYERS,
            steam_app_id: REFORGER_APP_ID,
            password: None,
            admin_password: None,
        }
    }

    /// Merge a partial update. Empty password strings clear the password.
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(max_players) = patch.max_players {
            self.max_players = max_players;
        }
        if let Some(app_id) = patch.steam_app_id {
            self.steam_app_id = app_id;
        }
        if let Some(pw) = patch.password {
            self.password = (!pw.is_empty()).then_some(pw);
        }
        if let Some(pw) = patch.admin_password {
            self.admin_password = (!pw.is_empty()).then_some(pw);
        }
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("config.name must not be empty".into()));
        }
        if self.port == 0 {
            return Err(SupervisorError::InvalidRequest("config.port must be non-zero".into()));
        }
        if self.max_players == 0 {
            return Err(SupervisorError::InvalidRequest("config.maxPlayers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Partial config for `PUT /api/instances/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub max_players: Option<u32>,
    pub steam_app_id: Option<u32>,
    pub password: Option<String>,
    pub admin_password: Option<String>,
}

/// Instance as reported to clients. `is_installed`/`is_running` are computed
/// at read time and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    pub id: String,
    pub config: ServerConfig,
    pub is_installed: bool,
    pub is_running: bool,
    pub state: String,
    /// Only set on degraded records whose config could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registry backed by the instances directory.
pub struct InstanceStore {
    root: PathBuf,
    ids: RwLock<BTreeSet<String>>,
}

impl InstanceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ids: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(CONFIG_FILE)
    }

    /// Rebuild the id index from the subdirectories of the instances root.
    pub async fn reconcile(&self) -> SupervisorResult<usize> {
        let found = self.scan().await?;
        let count = found.len();
        *self.ids.write().await = found;
        tracing::info!("Registry reconciled: {} instances under {}", count, self.root.display());
        Ok(count)
    }

    async fn scan(&self) -> SupervisorResult<BTreeSet<String>> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SupervisorError::io(format!("create {}", self.root.display()), e))?;

        let mut found = BTreeSet::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| SupervisorError::io(format!("read {}", self.root.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SupervisorError::io(format!("read {}", self.root.display()), e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_safe_id(&name) {
                found.insert(name);
            } else {
                tracing::warn!("Ignoring directory with unsafe name: {:?}", name);
            }
        }
        Ok(found)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.ids.read().await.contains(id)
    }

    /// Error unless `id` is registered and its directory still exists.
    pub async fn ensure_exists(&self, id: &str) -> SupervisorResult<()> {
        if !self.contains(id).await {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        if !fs::try_exists(self.instance_dir(id)).await.unwrap_or(false) {
            tracing::warn!("Instance directory for '{}' vanished, dropping it", id);
            self.ids.write().await.remove(id);
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Create the directory skeleton and persist `config`.
    pub async fn create(&self, id: &str, config: &ServerConfig) -> SupervisorResult<()> {
        if !is_safe_id(id) {
            return Err(SupervisorError::InvalidRequest(format!(
                "id '{}' must be 1-64 characters of [A-Za-z0-9_-]",
                id
            )));
        }
        config.validate()?;

        let mut ids = self.ids.write().await;
        let dir = self.instance_dir(id);
        if ids.contains(id) || fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(SupervisorError::Conflict(format!("Instance '{}' already exists", id)));
        }

        for sub in SKELETON_DIRS {
            let path = dir.join(sub);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| SupervisorError::io(format!("create {}", path.display()), e))?;
        }
        self.write_config(id, config).await?;
        ids.insert(id.to_string());

        tracing::info!("Created instance '{}' at {}", id, dir.display());
        Ok(())
    }

    pub async fn read_config(&self, id: &str) -> SupervisorResult<ServerConfig> {
        let path = self.config_path(id);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| SupervisorError::io(format!("read {}", path.display()), e))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Malformed {}", path.display()))?;
        Ok(config)
    }

    /// Write through a temp file so a crash never leaves a truncated config.
    async fn write_config(&self, id: &str, config: &ServerConfig) -> SupervisorResult<()> {
        let path = self.config_path(id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&tmp, content)
            .await
            .map_err(|e| SupervisorError::io(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SupervisorError::io(format!("replace {}", path.display()), e))?;
        Ok(())
    }

    pub async fn update_config(&self, id: &str, patch: ConfigPatch) -> SupervisorResult<ServerConfig> {
        self.ensure_exists(id).await?;
        let mut config = self.read_config(id).await?;
        config.apply(patch);
        config.validate()?;
        self.write_config(id, &config).await?;
        tracing::info!("Updated config of '{}'", id);
        Ok(config)
    }

    /// Remove the whole instance tree. The id stays registered if removal fails.
    pub async fn delete(&self, id: &str) -> SupervisorResult<()> {
        self.ensure_exists(id).await?;
        let dir = self.instance_dir(id);
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SupervisorError::io(format!("remove {}", dir.display()), e))?;
        self.ids.write().await.remove(id);
        tracing::info!("Deleted instance '{}'", id);
        Ok(())
    }

    /// Rescan disk and return every id, sorted.
    pub async fn list_ids(&self) -> SupervisorResult<Vec<String>> {
        let found = self.scan().await?;
        let ids: Vec<String> = found.iter().cloned().collect();
        *self.ids.write().await = found;
        Ok(ids)
    }

    pub async fn is_installed(&self, id: &str) -> bool {
        fs::try_exists(self.instance_dir(id).join(INSTALL_MARKER))
            .await
            .unwrap_or(false)
    }

    pub async fn mark_installed(&self, id: &str, app_id: u32) -> SupervisorResult<()> {
        let path = self.instance_dir(id).join(INSTALL_MARKER);
        let body = serde_json::json!({
            "appId": app_id,
            "installedAt": crate::utils::current_timestamp(),
        });
        fs::write(&path, body.to_string())
            .await
            .map_err(|e| SupervisorError::io(format!("write {}", path.display()), e))
    }

    pub async fn clear_installed(&self, id: &str) -> SupervisorResult<()> {
        let path = self.instance_dir(id).join(INSTALL_MARKER);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::io(format!("remove {}", path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn alpha() -> ServerConfig {
        ServerConfig {
            name: "Alpha".into(),
            port: 2302,
            max_players: 16,
            steam_app_id: 1874880,
            password: None,
            admin_password: None,
        }
    }

    async fn store() -> (TempDir, InstanceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("servers"));
        store.reconcile().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_writes_skeleton_and_config() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();

        let root = store.instance_dir("alpha");
        for sub in SKELETON_DIRS {
            assert!(root.join(sub).is_dir(), "missing {}", sub);
        }
        assert_eq!(store.read_config("alpha").await.unwrap(), alpha());
        assert!(!store.is_installed("alpha").await);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts_and_keeps_config() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();

        let mut other = alpha();
        other.name = "Impostor".into();
        let err = store.create("alpha", &other).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict(_)));
        assert_eq!(store.read_config("alpha").await.unwrap().name, "Alpha");
    }

    #[tokio::test]
    async fn unsafe_ids_are_rejected() {
        let (_dir, store) = store().await;
        for id in ["../escape", "a/b", "", "dot.dot"] {
            let err = store.create(id, &alpha()).await.unwrap_err();
            assert!(matches!(err, SupervisorError::InvalidRequest(_)), "{}", id);
        }
    }

    #[tokio::test]
    async fn reconcile_picks_up_existing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("servers");
        std::fs::create_dir_all(root.join("bravo")).unwrap();
        std::fs::create_dir_all(root.join("charlie")).unwrap();
        std::fs::write(root.join("stray.txt"), "x").unwrap();

        let store = InstanceStore::new(&root);
        assert_eq!(store.reconcile().await.unwrap(), 2);
        assert!(store.contains("bravo").await);
        assert_eq!(store.list_ids().await.unwrap(), vec!["bravo", "charlie"]);
    }

    #[tokio::test]
    async fn externally_removed_dir_is_not_found() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();
        std::fs::remove_dir_all(store.instance_dir("alpha")).unwrap();
        let err = store.ensure_exists("alpha").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
        assert!(!store.contains("alpha").await);
    }

    #[tokio::test]
    async fn update_merges_and_clears_passwords() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();

        let updated = store
            .update_config(
                "alpha",
                ConfigPatch {
                    max_players: Some(64),
                    password: Some("hunter2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.max_players, 64);
        assert_eq!(updated.port, 2302);
        assert_eq!(updated.password.as_deref(), Some("hunter2"));

        let cleared = store
            .update_config(
                "alpha",
                ConfigPatch {
                    password: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.password.is_none());
        assert_eq!(store.read_config("alpha").await.unwrap(), cleared);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.update_config("ghost", ConfigPatch::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn install_marker_roundtrip() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();
        store.mark_installed("alpha", 1874880).await.unwrap();
        assert!(store.is_installed("alpha").await);
        store.clear_installed("alpha").await.unwrap();
        assert!(!store.is_installed("alpha").await);
        // Clearing twice is fine.
        store.clear_installed("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_tree() {
        let (_dir, store) = store().await;
        store.create("alpha", &alpha()).await.unwrap();
        store.delete("alpha").await.unwrap();
        assert!(!store.instance_dir("alpha").exists());
        assert!(matches!(
            store.delete("alpha").await.unwrap_err(),
            SupervisorError::NotFound(_)
        ));
    }

    #[test]
    fn config_defaults_from_sparse_json() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"name":"Sparse"}"#).unwrap();
        assert_eq!(cfg.port, 2302);
        assert_eq!(cfg.max_players, 32);
        assert_eq!(cfg.steam_app_id, 1874880);
        let json = serde_json::to_value(&cfg).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["maxPlayers"], 32);
    }
}

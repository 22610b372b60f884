//! Orchestration façade.
//!
//! `Supervisor` ties the registry, installer, process store and event
//! broadcaster together and is the only type the IPC layer talks to.
//! Lifecycle operations on one instance id are serialized through a
//! per-id async lock; different ids never wait on each other.

pub mod error;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::GlobalConfig;
use crate::events::{ConsoleLine, EventBroadcaster};
use crate::installer::{Installer, JobStatus, SteamCmd};
use crate::instance::files::{self, PathContent};
use crate::instance::{ConfigPatch, InstanceStore, ServerConfig, ServerInstance};
use crate::process_monitor;
use crate::utils::is_safe_id;

use self::error::{SupervisorError, SupervisorResult};
use self::managed_process::ManagedProcessStore;
use self::process::ProcessError;
use self::state_machine::{State, StateTable};

/// Rendered before every start, read by the game server via `-config`.
pub const RUNTIME_CONFIG_FILE: &str = "serverConfig.json";
/// How long to wait for the exit after SIGKILL before giving up on the handle.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Reply to `POST /install`; the job itself runs in the background.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStarted {
    pub started: bool,
    pub server_id: String,
    pub job_id: String,
}

/// Install state of one instance; `job` is present only while installing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub server_id: String,
    pub installing: bool,
    pub is_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStatus>,
}

/// Instance after `start`, flagged when the call was a no-op.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    #[serde(flatten)]
    pub instance: ServerInstance,
    pub already_running: bool,
}

/// Instance after `stop`; `not_running` when there was nothing to stop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    #[serde(flatten)]
    pub instance: ServerInstance,
    pub not_running: bool,
}

/// Runtime figures sampled from the OS process table.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since spawn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f32>,
    /// MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    /// Always empty: player lists need a game query protocol.
    pub players: Vec<String>,
}

impl ServerStats {
    /// `{running: false, players: []}`, nothing else is reported.
    pub fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
            uptime: None,
            cpu: None,
            memory: None,
            players: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamCmdStatus {
    /// Whether the SteamCMD launcher exists under `steamcmd_dir`.
    pub installed: bool,
    pub path: PathBuf,
}

pub struct Supervisor {
    config: GlobalConfig,
    /// Registry of instance directories.
    store: Arc<InstanceStore>,
    installer: Arc<Installer>,
    processes: Arc<ManagedProcessStore>,
    states: StateTable,
    events: EventBroadcaster,
    /// One async mutex per instance id.
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    /// Wire up all components. Nothing touches disk until `initialize`.
    pub fn new(config: GlobalConfig) -> Self {
        let events = EventBroadcaster::new(config.event_buffer);
        let store = Arc::new(InstanceStore::new(config.instances_dir()));
        let steamcmd = SteamCmd::new(config.steamcmd_dir(), config.steamcmd_url.clone());
        let installer = Arc::new(Installer::new(
            steamcmd,
            store.clone(),
            events.clone(),
            config.install_timeout(),
        ));
        let processes = Arc::new(ManagedProcessStore::new(events.console.clone()));

        Self {
            config,
            store,
            installer,
            processes,
            states: StateTable::new(),
            events,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the registry from disk. No process survives a daemon restart,
    /// so every instance starts out stopped.
    pub async fn initialize(&self) -> SupervisorResult<usize> {
        let count = self.store.reconcile().await?;
        tracing::info!("Supervisor ready: {} instances", count);
        Ok(count)
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Lock an existing instance. Checked before and after waiting, so an
    /// id deleted in the meantime is reported as not found.
    async fn lock_instance(&self, id: &str) -> SupervisorResult<OwnedMutexGuard<()>> {
        self.store.ensure_exists(id).await?;
        let guard = self.lock(id).await;
        self.store.ensure_exists(id).await?;
        Ok(guard)
    }

    /// Drop the lock entry of a deleted id unless another task still holds
    /// or waits on it; a recreated id must keep contending on the same mutex.
    fn forget_lock(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    async fn describe(&self, id: &str, config: ServerConfig, error: Option<String>) -> ServerInstance {
        let is_running = self.processes.is_running(id).await;
        let state = if self.installer.is_installing(id).await {
            "installing".to_string()
        } else {
            self.states.observe(id, is_running).as_str().to_string()
        };
        ServerInstance {
            id: id.to_string(),
            config,
            is_installed: self.store.is_installed(id).await,
            is_running,
            state,
            error,
        }
    }

    // ─── Registry ────────────────────────────────────────────

    /// Every instance on disk, sorted by id. Unreadable configs yield a
    /// record with `error` set instead of failing the whole list.
    pub async fn list(&self) -> SupervisorResult<Vec<ServerInstance>> {
        let ids = self.store.list_ids().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let instance = match self.store.read_config(&id).await {
                Ok(config) => self.describe(&id, config, None).await,
                Err(e) => {
                    tracing::warn!("Config of '{}' unreadable: {}", id, e);
                    self.describe(&id, ServerConfig::new(&id), Some(e.to_string())).await
                }
            };
            out.push(instance);
        }
        Ok(out)
    }

    /// Fresh view of one instance: installed and running flags are
    /// recomputed on every call.
    pub async fn get(&self, id: &str) -> SupervisorResult<ServerInstance> {
        self.store.ensure_exists(id).await?;
        let config = self.store.read_config(id).await?;
        Ok(self.describe(id, config, None).await)
    }

    /// Create the directory skeleton and persist `config`.
    pub async fn create(&self, id: &str, config: ServerConfig) -> SupervisorResult<ServerInstance> {
        if !is_safe_id(id) {
            return Err(SupervisorError::InvalidRequest(format!(
                "id '{}' must be 1-64 characters of [A-Za-z0-9_-]",
                id
            )));
        }
        let _guard = self.lock(id).await;
        self.store.create(id, &config).await?;
        Ok(self.describe(id, config, None).await)
    }

    /// Merge `patch` into the stored config. Takes effect on the next start.
    pub async fn update_config(&self, id: &str, patch: ConfigPatch) -> SupervisorResult<ServerConfig> {
        let _guard = self.lock_instance(id).await?;
        self.store.update_config(id, patch).await
    }

    /// Remove an instance from any state: abort an install, stop the
    /// server, then delete the directory tree.
    pub async fn delete(&self, id: &str) -> SupervisorResult<()> {
        let guard = self.lock_instance(id).await?;

        if self.installer.cancel(id).await {
            tracing::info!("Aborted install of '{}' before deletion", id);
        }
        self.stop_locked(id).await?;
        self.store.delete(id).await?;
        self.processes.forget(id).await;
        self.states.forget(id);

        drop(guard);
        self.forget_lock(id);
        Ok(())
    }

    // ─── Installation ────────────────────────────────────────

    /// Begin (re)installing `id`. Returns as soon as the job is registered.
    pub async fn install(&self, id: &str) -> SupervisorResult<InstallStarted> {
        let _guard = self.lock_instance(id).await?;

        if self.processes.get_live(id).await.is_some() {
            return Err(SupervisorError::Conflict(format!(
                "Server '{}' is running. Stop it before installing.",
                id
            )));
        }
        if self.installer.is_installing(id).await {
            return Err(SupervisorError::Conflict(format!(
                "Installation already in progress for '{}'",
                id
            )));
        }

        let config = self.store.read_config(id).await?;
        let app_id = match config.steam_app_id {
            0 => self.config.default_app_id,
            n => n,
        };

        // isInstalled must read false until this job succeeds.
        self.store.clear_installed(id).await?;
        let job = self.installer.begin(id, app_id).await?;

        Ok(InstallStarted {
            started: true,
            server_id: id.to_string(),
            job_id: job.job_id,
        })
    }

    /// Whether a job is running for `id`, plus its latest progress.
    pub async fn install_status(&self, id: &str) -> SupervisorResult<InstallStatus> {
        self.store.ensure_exists(id).await?;
        let job = self.installer.status(id).await;
        Ok(InstallStatus {
            server_id: id.to_string(),
            installing: job.is_some(),
            is_installed: self.store.is_installed(id).await,
            job,
        })
    }

    pub fn steamcmd_status(&self) -> SteamCmdStatus {
        let steamcmd = self.installer.steamcmd();
        SteamCmdStatus {
            installed: steamcmd.is_installed(),
            path: steamcmd.executable(),
        }
    }

    /// Bootstrap SteamCMD ahead of the first install.
    pub async fn install_steamcmd(&self) -> SupervisorResult<SteamCmdStatus> {
        let path = self
            .installer
            .steamcmd()
            .ensure_installed()
            .await
            .map_err(|e| SupervisorError::Internal(e.context("SteamCMD bootstrap failed")))?;
        Ok(SteamCmdStatus { installed: true, path })
    }

    // ─── Process lifecycle ───────────────────────────────────

    fn server_args(&self, root: &std::path::Path, config: &ServerConfig) -> Vec<String> {
        let mut args = vec![
            "-config".to_string(),
            root.join(RUNTIME_CONFIG_FILE).to_string_lossy().into_owned(),
            format!("-port={}", config.port),
            format!("-maxPlayers={}", config.max_players),
        ];
        if let Some(pw) = &config.password {
            args.push(format!("-password={}", pw));
        }
        if let Some(pw) = &config.admin_password {
            args.push(format!("-adminPassword={}", pw));
        }
        args
    }

    async fn write_runtime_config(&self, root: &std::path::Path, config: &ServerConfig) -> SupervisorResult<()> {
        let runtime = json!({
            "bindPort": config.port,
            "publicPort": config.port,
            "game": {
                "name": config.name,
                "password": config.password.clone().unwrap_or_default(),
                "passwordAdmin": config.admin_password.clone().unwrap_or_default(),
                "maxPlayers": config.max_players,
            }
        });
        let path = root.join(RUNTIME_CONFIG_FILE);
        let body = serde_json::to_string_pretty(&runtime).map_err(anyhow::Error::from)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| SupervisorError::io(format!("write {}", path.display()), e))
    }

    /// Spawn the dedicated server. Starting a running instance is a no-op
    /// reported through `already_running`.
    pub async fn start(&self, id: &str) -> SupervisorResult<StartOutcome> {
        let _guard = self.lock_instance(id).await?;
        let config = self.store.read_config(id).await?;

        if self.processes.get_live(id).await.is_some() {
            tracing::info!("Server '{}' is already running", id);
            return Ok(StartOutcome {
                instance: self.describe(id, config, None).await,
                already_running: true,
            });
        }
        if self.installer.is_installing(id).await {
            return Err(SupervisorError::Conflict(format!(
                "Installation in progress for '{}'",
                id
            )));
        }
        if !self.store.is_installed(id).await {
            return Err(SupervisorError::NotInstalled(id.to_string()));
        }

        let root = self.store.instance_dir(id);
        let exe = root.join(&self.config.server_executable);
        if !exe.is_file() {
            return Err(SupervisorError::ExecutableMissing(exe));
        }

        self.states.observe(id, false);
        if self.states.transition(id, State::Starting).is_err() {
            self.states.reset(id, State::Starting);
        }

        if let Err(e) = self.write_runtime_config(&root, &config).await {
            self.states.reset(id, State::Stopped);
            return Err(e);
        }
        let args = self.server_args(&root, &config);
        tracing::info!("Starting server '{}' on port {}", id, config.port);

        match self.processes.spawn(id, &exe, &args, &root).await {
            Ok(process) => {
                let _ = self.states.transition(id, State::Running);
                tracing::info!("Server '{}' started with PID {}", id, process.pid);
            }
            Err(e) => {
                let _ = self.states.transition(id, State::Stopped);
                return Err(SupervisorError::SubprocessFailure {
                    message: format!("Failed to start server '{}': {}", id, e),
                    code: None,
                    output: String::new(),
                });
            }
        }

        Ok(StartOutcome {
            instance: self.describe(id, config, None).await,
            already_running: false,
        })
    }

    /// Stop the server, escalating to a kill after `stop_timeout_secs`.
    pub async fn stop(&self, id: &str) -> SupervisorResult<StopOutcome> {
        let _guard = self.lock_instance(id).await?;
        let stopped = self.stop_locked(id).await?;
        let config = self.store.read_config(id).await?;
        Ok(StopOutcome {
            instance: self.describe(id, config, None).await,
            not_running: !stopped,
        })
    }

    /// Two-phase stop. Caller holds the instance lock. Returns false when
    /// nothing was running.
    async fn stop_locked(&self, id: &str) -> SupervisorResult<bool> {
        let Some(process) = self.processes.get_live(id).await else {
            return Ok(false);
        };
        if self.states.transition(id, State::Stopping).is_err() {
            self.states.reset(id, State::Stopping);
        }

        let pid = process.pid;
        let timeout = self.config.stop_timeout();
        tracing::info!("Stopping server '{}' (pid {})", id, pid);
        process.push_system("Stopping server...").await;

        match process::request_terminate(pid) {
            Ok(()) | Err(ProcessError::NotFound { .. }) => {}
            Err(e) => tracing::warn!("Graceful stop of '{}' failed: {}", id, e),
        }

        if !process.wait_for_exit_timeout(timeout).await {
            tracing::warn!("Server '{}' ignored TERM for {:?}, killing it", id, timeout);
            process
                .push_system(format!("Server did not stop within {}s, forcing shutdown", timeout.as_secs()))
                .await;
            match process::force_kill(pid) {
                Ok(()) | Err(ProcessError::NotFound { .. }) => {}
                Err(e) => tracing::error!("Force kill of '{}' failed: {}", id, e),
            }
            if !process.wait_for_exit_timeout(FORCE_KILL_WAIT).await {
                tracing::error!("Server '{}' (pid {}) did not exit after KILL", id, pid);
            }
        }

        self.processes.remove(id).await;
        self.states.reset(id, State::Stopped);
        tracing::info!("Server '{}' stopped", id);
        Ok(true)
    }

    /// CPU, memory and uptime of the running server.
    pub async fn stats(&self, id: &str) -> SupervisorResult<ServerStats> {
        self.store.ensure_exists(id).await?;
        let Some(process) = self.processes.get_live(id).await else {
            return Ok(ServerStats::stopped());
        };
        let Some(sample) = process_monitor::sample_async(process.pid).await else {
            return Ok(ServerStats::stopped());
        };
        Ok(ServerStats {
            running: true,
            pid: Some(process.pid),
            uptime: Some(process.uptime().as_secs()),
            cpu: Some(sample.cpu),
            memory: Some(process_monitor::bytes_to_mib(sample.memory_bytes)),
            players: Vec::new(),
        })
    }

    /// Buffered console lines with id greater than `since`.
    pub async fn console(&self, id: &str, since: Option<u64>) -> SupervisorResult<Vec<ConsoleLine>> {
        self.store.ensure_exists(id).await?;
        Ok(self.processes.console_since(id, since).await)
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.processes.running_ids().await
    }

    // ─── Files ───────────────────────────────────────────────

    /// Listing for a directory, text for a file.
    pub async fn read_path(&self, id: &str, path: &str) -> SupervisorResult<PathContent> {
        self.store.ensure_exists(id).await?;
        files::read_path(&self.store.instance_dir(id), path).await
    }

    pub async fn write_file(&self, id: &str, path: &str, content: &str) -> SupervisorResult<()> {
        let _guard = self.lock_instance(id).await?;
        files::write_file(&self.store.instance_dir(id), path, content).await
    }

    pub async fn delete_file(&self, id: &str, path: &str) -> SupervisorResult<()> {
        let _guard = self.lock_instance(id).await?;
        files::remove(&self.store.instance_dir(id), path).await
    }

    // ─── Shutdown ────────────────────────────────────────────

    /// Abort installs and stop every running server.
    pub async fn shutdown(&self) {
        self.installer.cancel_all().await;
        let ids = self.processes.running_ids().await;
        if ids.is_empty() {
            return;
        }
        tracing::info!("Stopping {} running server(s)", ids.len());
        let stops = ids.iter().map(|id| async move {
            let _guard = self.lock(id).await;
            if let Err(e) = self.stop_locked(id).await {
                tracing::error!("Failed to stop '{}' during shutdown: {}", id, e);
            }
        });
        futures_util::future::join_all(stops).await;
    }
}

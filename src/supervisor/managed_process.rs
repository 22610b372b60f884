//! Managed Process - game server spawning with stdio capture
//!
//! Each running server has one `ManagedProcess`:
//! - stdout/stderr are read line by line, kept in a ring buffer and published
//!   to the console topic
//! - a waiter task observes the exit, drains the readers, publishes the final
//!   system line and only then flips the running watch to false
//! - the waiter removes its own store entry afterwards; a newer process for
//!   the same id (different generation) is left alone

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::{ConsoleLine, LogSource, Topic};
use crate::utils::{apply_creation_flags, current_timestamp};

/// Console lines kept per process for `?since=` polling.
pub const DEFAULT_LOG_BUFFER: usize = 2_000;
/// Upper bound on waiting for the readers after the process exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer of recent console lines with sequential ids.
pub struct LogBuffer {
    server_id: String,
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(server_id: &str, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            server_id: server_id.to_string(),
            lines: VecDeque::with_capacity(max_size.min(256)),
            next_id: 0,
            max_size,
        }
    }

    /// Append a line and return the stored copy.
    pub fn push(&mut self, stream: LogSource, data: String) -> ConsoleLine {
        let line = ConsoleLine {
            server_id: self.server_id.clone(),
            id: self.next_id,
            timestamp: current_timestamp(),
            stream,
            data,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// Lines with `id > since`, or everything when `since` is `None`.
    pub fn since(&self, since: Option<u64>) -> Vec<ConsoleLine> {
        self.lines
            .iter()
            .filter(|l| since.map_or(true, |s| l.id > s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

type SharedBuffer = Arc<Mutex<LogBuffer>>;

async fn record(buf: &SharedBuffer, console: &Topic<ConsoleLine>, stream: LogSource, data: String) {
    let line = buf.lock().await.push(stream, data);
    console.publish(&line.server_id, line.clone());
}

// ─── Managed Process ─────────────────────────────────────────

/// A game server process owned by the daemon.
pub struct ManagedProcess {
    pub server_id: String,
    pub pid: u32,
    generation: u64,
    started: Instant,
    log_buffer: SharedBuffer,
    console: Topic<ConsoleLine>,
    running_rx: watch::Receiver<bool>,
}

impl ManagedProcess {
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Time since spawn.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn console_since(&self, since: Option<u64>) -> Vec<ConsoleLine> {
        self.log_buffer.lock().await.since(since)
    }

    /// Add a daemon message to this process's console.
    pub async fn push_system(&self, message: impl Into<String>) {
        record(&self.log_buffer, &self.console, LogSource::System, message.into()).await;
    }

    /// Wait until the waiter task has published the exit.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Like `wait_for_exit`, giving up after `timeout`. Returns true if exited.
    pub async fn wait_for_exit_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_exit()).await.is_ok()
    }
}

// ─── Managed Process Store ───────────────────────────────────

/// Live handle table. Console output of the last exited process per id is
/// kept until the next start or until the instance is forgotten.
pub struct ManagedProcessStore {
    processes: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    retired: Mutex<HashMap<String, SharedBuffer>>,
    console: Topic<ConsoleLine>,
    next_generation: AtomicU64,
    log_capacity: usize,
}

impl ManagedProcessStore {
    pub fn new(console: Topic<ConsoleLine>) -> Self {
        Self::with_log_capacity(console, DEFAULT_LOG_BUFFER)
    }

    pub fn with_log_capacity(console: Topic<ConsoleLine>, log_capacity: usize) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            console,
            next_generation: AtomicU64::new(1),
            log_capacity,
        }
    }

    /// Spawn `program` for `server_id` and register the handle.
    pub async fn spawn(
        self: &Arc<Self>,
        server_id: &str,
        program: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<Arc<ManagedProcess>> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", program.display(), e))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (running_tx, running_rx) = watch::channel(true);
        let log_buffer: SharedBuffer = Arc::new(Mutex::new(LogBuffer::new(server_id, self.log_capacity)));

        record(
            &log_buffer,
            &self.console,
            LogSource::System,
            format!("Server process started with PID {}", pid),
        )
        .await;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(server_id, stdout, LogSource::Stdout, log_buffer.clone(), self.console.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(server_id, stderr, LogSource::Stderr, log_buffer.clone(), self.console.clone()));
        }

        let process = Arc::new(ManagedProcess {
            server_id: server_id.to_string(),
            pid,
            generation,
            started: Instant::now(),
            log_buffer: log_buffer.clone(),
            console: self.console.clone(),
            running_rx,
        });

        // Register before the waiter exists so its removal always finds the entry.
        self.retired.lock().await.remove(server_id);
        self.processes
            .lock()
            .await
            .insert(server_id.to_string(), process.clone());

        let store = Arc::downgrade(self);
        let console = self.console.clone();
        let id = server_id.to_string();
        tokio::spawn(async move {
            let exit_msg = match child.wait().await {
                Ok(status) => format!("Server process exited with {}", status),
                Err(e) => format!("Failed to wait for server process: {}", e),
            };

            let drain = async {
                for reader in readers {
                    let _ = reader.await;
                }
            };
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::debug!("Output of '{}' still open after exit, not waiting further", id);
            }

            tracing::info!("[{}] {}", id, exit_msg);
            record(&log_buffer, &console, LogSource::System, exit_msg).await;
            let _ = running_tx.send(false);

            if let Some(store) = Weak::upgrade(&store) {
                store.retire(&id, generation, log_buffer).await;
            }
        });

        tracing::info!("Spawned '{}' for '{}' (pid {})", program.display(), server_id, pid);
        Ok(process)
    }

    /// The registered handle for `server_id`, dead or alive.
    pub async fn get(&self, server_id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.lock().await.get(server_id).cloned()
    }

    /// The handle only if its process is still running. A dead entry whose
    /// waiter has not cleaned up yet is dropped here.
    pub async fn get_live(&self, server_id: &str) -> Option<Arc<ManagedProcess>> {
        let mut map = self.processes.lock().await;
        match map.get(server_id) {
            Some(p) if p.is_running() => Some(p.clone()),
            Some(_) => {
                tracing::debug!("Dropping stale handle for '{}'", server_id);
                map.remove(server_id);
                None
            }
            None => None,
        }
    }

    /// Drop the handle; its console stays readable until the next spawn.
    pub async fn remove(&self, server_id: &str) -> Option<Arc<ManagedProcess>> {
        let mut map = self.processes.lock().await;
        let process = map.get(server_id)?.clone();
        // Retire before unlinking so the backlog never reads empty in between.
        self.retired
            .lock()
            .await
            .insert(server_id.to_string(), process.log_buffer.clone());
        map.remove(server_id)
    }

    async fn retire(&self, server_id: &str, generation: u64, log_buffer: SharedBuffer) {
        let mut map = self.processes.lock().await;
        let current = map.get(server_id).map(|p| p.generation);
        // A newer process already owns the console for this id.
        if current.map_or(true, |g| g == generation) {
            self.retired.lock().await.insert(server_id.to_string(), log_buffer);
        }
        if current == Some(generation) {
            map.remove(server_id);
        }
    }

    pub async fn is_running(&self, server_id: &str) -> bool {
        self.processes
            .lock()
            .await
            .get(server_id)
            .map(|p| p.is_running())
            .unwrap_or(false)
    }

    /// Ids with a live process, sorted.
    pub async fn running_ids(&self) -> Vec<String> {
        let map = self.processes.lock().await;
        let mut ids: Vec<String> = map
            .iter()
            .filter(|(_, p)| p.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Console backlog of the live process, or of the last one that exited.
    /// Console of the live process, or of the last one that exited.
    pub async fn console_since(&self, server_id: &str, since: Option<u64>) -> Vec<ConsoleLine> {
        if let Some(process) = self.get(server_id).await {
            return process.console_since(since).await;
        }
        let retired = self.retired.lock().await.get(server_id).cloned();
        match retired {
            Some(buf) => buf.lock().await.since(since),
            None => Vec::new(),
        }
    }

    /// Drop everything known about `server_id`.
    pub async fn forget(&self, server_id: &str) {
        self.processes.lock().await.remove(server_id);
        self.retired.lock().await.remove(server_id);
    }
}

fn spawn_reader<R>(
    server_id: &str,
    pipe: R,
    stream: LogSource,
    buf: SharedBuffer,
    console: Topic<ConsoleLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let server_id = server_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server_id = %server_id, stream = ?stream, "{}", line);
            record(&buf, &console, stream, line).await;
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────

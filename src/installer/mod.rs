//! Installer driver: runs SteamCMD for one instance at a time and turns its
//! output into `install-progress` events.
//!
//! Each job runs on its own task. The job table holds at most one job per
//! instance id together with its latest progress snapshot and the token used
//! to abort it. A job is removed from the table before its terminal event is
//! published, so a client reacting to that event can immediately start a new
//! install.

pub mod progress;
mod steamcmd;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBroadcaster, InstallProgress};
use crate::instance::InstanceStore;
use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::supervisor::process::{self, ProcessError};
use crate::utils::{apply_creation_flags, current_timestamp, new_process_group};

use self::progress::{ProgressTracker, TASK_FINALIZING, TASK_STARTING};
pub use self::steamcmd::SteamCmd;

/// Upper bound on waiting for a killed SteamCMD tree to disappear.
#[cfg(not(target_os = "windows"))]
const TREE_EXIT_WAIT: Duration = Duration::from_secs(2);

/// Snapshot of an in-flight job, served by `GET /api/instances/:id/install`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub server_id: String,
    pub app_id: u32,
    pub progress: u8,
    pub task: String,
    pub started_at: u64,
}

struct InstallJob {
    status: JobStatus,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Why a job did not succeed.
#[derive(Debug)]
enum JobFailure {
    Bootstrap(anyhow::Error),
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Exit(Option<i32>),
    Marker(SupervisorError),
    Cancelled,
    TimedOut(Duration),
}

impl JobFailure {
    fn task(&self) -> String {
        match self {
            Self::Bootstrap(_) => "Installation failed: SteamCMD could not be installed".into(),
            Self::Spawn(_) => "Installation failed: SteamCMD could not be started".into(),
            Self::Wait(_) => "Installation failed: lost track of SteamCMD".into(),
            Self::Exit(Some(code)) => format!("Installation failed (exit code {})", code),
            Self::Exit(None) => "Installation failed (SteamCMD was terminated)".into(),
            Self::Marker(_) => "Installation failed: could not record completion".into(),
            Self::Cancelled => "Installation cancelled".into(),
            Self::TimedOut(d) => format!("Installation failed: timed out after {}s", d.as_secs()),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(code) => *code,
            _ => None,
        }
    }
}

pub struct Installer {
    steamcmd: SteamCmd,
    store: Arc<InstanceStore>,
    events: EventBroadcaster,
    jobs: Mutex<HashMap<String, InstallJob>>,
    timeout: Option<Duration>,
}

impl Installer {
    pub fn new(
        steamcmd: SteamCmd,
        store: Arc<InstanceStore>,
        events: EventBroadcaster,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            steamcmd,
            store,
            events,
            jobs: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn steamcmd(&self) -> &SteamCmd {
        &self.steamcmd
    }

    /// Register a job for `id` and run it in the background.
    pub async fn begin(self: &Arc<Self>, id: &str, app_id: u32) -> SupervisorResult<JobStatus> {
        let status = JobStatus {
            job_id: uuid::Uuid::new_v4().to_string(),
            server_id: id.to_string(),
            app_id,
            progress: 0,
            task: TASK_STARTING.to_string(),
            started_at: current_timestamp(),
        };
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(id) {
                return Err(SupervisorError::Conflict(format!(
                    "Installation already in progress for '{}'",
                    id
                )));
            }
            jobs.insert(
                id.to_string(),
                InstallJob {
                    status: status.clone(),
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        tracing::info!("Install job {} started for '{}' (app {})", status.job_id, id, app_id);
        self.events
            .install
            .publish(id, InstallProgress::running(id, 0, TASK_STARTING));

        let this = Arc::clone(self);
        let server_id = id.to_string();
        tokio::spawn(async move {
            this.run_job(&server_id, app_id, cancel).await;
            let _ = done_tx.send(true);
        });

        Ok(status)
    }

    pub async fn status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.lock().await.get(id).map(|job| job.status.clone())
    }

    pub async fn is_installing(&self, id: &str) -> bool {
        self.jobs.lock().await.contains_key(id)
    }

    /// Abort the job for `id` and wait until it has fully wound down.
    /// Returns false when no job was running.
    pub async fn cancel(&self, id: &str) -> bool {
        let done = {
            let jobs = self.jobs.lock().await;
            match jobs.get(id) {
                Some(job) => {
                    job.cancel.cancel();
                    job.done.clone()
                }
                None => return false,
            }
        };
        tracing::info!("Cancelling install job for '{}'", id);
        wait_done(done).await;
        true
    }

    pub async fn cancel_all(&self) {
        let ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        for id in ids {
            self.cancel(&id).await;
        }
    }

    async fn run_job(&self, id: &str, app_id: u32, cancel: CancellationToken) {
        let mut tracker = ProgressTracker::new();
        let tree = ProcessTree::default();

        let result = tokio::select! {
            r = self.execute(id, app_id, &mut tracker, &tree) => r,
            _ = cancel.cancelled() => Err(JobFailure::Cancelled),
            _ = deadline(self.timeout) => Err(JobFailure::TimedOut(self.timeout.unwrap_or_default())),
        };
        // SteamCMD's launcher script runs the real client as a child; take
        // the whole group down before the job counts as finished.
        tree.kill().await;

        let event = match result {
            Ok(()) => {
                tracing::info!("Installation of '{}' completed", id);
                InstallProgress::succeeded(id)
            }
            Err(failure) => {
                let detail = match &failure {
                    JobFailure::Bootstrap(e) => Some(format!("{:#}", e)),
                    JobFailure::Spawn(e) | JobFailure::Wait(e) => Some(e.to_string()),
                    JobFailure::Marker(e) => Some(e.to_string()),
                    _ => {
                        let tail = tracker.tail();
                        match tracker.last_error() {
                            Some(err) if !tail.contains(err) => Some(format!("{}\n{}", err, tail)),
                            _ => (!tail.is_empty()).then_some(tail),
                        }
                    }
                };
                tracing::error!("Installation of '{}' failed: {:?}", id, failure);
                InstallProgress::failed(id, tracker.progress(), failure.task(), detail, failure.exit_code())
            }
        };

        self.jobs.lock().await.remove(id);
        self.events.install.publish(id, event);
    }

    async fn execute(
        &self,
        id: &str,
        app_id: u32,
        tracker: &mut ProgressTracker,
        tree: &ProcessTree,
    ) -> Result<(), JobFailure> {
        let exe = self
            .steamcmd
            .ensure_installed()
            .await
            .map_err(JobFailure::Bootstrap)?;

        let install_dir = self.store.instance_dir(id);
        let mut cmd = Command::new(&exe);
        cmd.args(SteamCmd::install_args(&install_dir, app_id))
            .current_dir(self.steamcmd.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);
        new_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(JobFailure::Spawn)?;
        tree.set(child.id());
        tracing::info!("SteamCMD running for '{}' (pid {:?})", id, child.id());

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        tracing::info!(server_id = %id, "[steamcmd] {}", line);
                        if tracker.observe(&line) {
                            self.report(id, tracker.progress(), tracker.task()).await;
                        }
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        tracing::warn!(server_id = %id, "[steamcmd] {}", line);
                        tracker.record(&line);
                    }
                    None => stderr = None,
                },
            }
        }

        let status = child.wait().await.map_err(JobFailure::Wait)?;
        if !status.success() {
            return Err(JobFailure::Exit(status.code()));
        }

        if tracker.task() != TASK_FINALIZING {
            self.report(id, tracker.progress(), TASK_FINALIZING).await;
        }
        self.store
            .mark_installed(id, app_id)
            .await
            .map_err(JobFailure::Marker)?;
        Ok(())
    }

    async fn report(&self, id: &str, progress: u8, task: &str) {
        if let Some(job) = self.jobs.lock().await.get_mut(id) {
            job.status.progress = progress;
            job.status.task = task.to_string();
        }
        self.events
            .install
            .publish(id, InstallProgress::running(id, progress, task));
    }
}

/// Root pid of the SteamCMD process tree of one job.
#[derive(Default)]
struct ProcessTree {
    root: std::sync::Mutex<Option<u32>>,
}

impl ProcessTree {
    fn set(&self, pid: Option<u32>) {
        *self.root.lock().unwrap_or_else(|p| p.into_inner()) = pid;
    }

    /// Kill whatever is left of the tree and wait (bounded) until it is gone.
    async fn kill(&self) {
        let Some(pid) = self.root.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        match process::kill_tree(pid) {
            Ok(()) => {}
            // Already gone, the usual case after a clean exit.
            Err(ProcessError::NotFound { .. }) => return,
            Err(e) => {
                tracing::warn!("Failed to kill SteamCMD tree {}: {}", pid, e);
                return;
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            let started = std::time::Instant::now();
            while process::group_exists(pid) {
                if started.elapsed() >= TREE_EXIT_WAIT {
                    tracing::debug!("SteamCMD group {} still listed after KILL", pid);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

async fn next_line<R: tokio::io::AsyncRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

//! Heuristic progress for SteamCMD output.
//!
//! SteamCMD prints no machine-readable progress, so lines are matched against
//! known markers and mapped onto coarse milestones. The only guarantees are
//! that the value never decreases and that it stays below 100 until the job
//! reports its terminal event.

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;

/// Highest value a non-terminal event may carry.
pub const MAX_RUNNING_PROGRESS: u8 = 99;
const AUTH_PROGRESS: u8 = 5;
const UPDATE_STATE_BASE: f64 = 10.0;
const UPDATE_STATE_SPAN: f64 = 85.0;
const UPDATE_STATE_CAP: u8 = 90;
const DOWNLOADING_CAP: u8 = 80;
const TAIL_LINES: usize = 20;

pub const TASK_STARTING: &str = "Starting installation...";
pub const TASK_AUTH: &str = "Authenticating with Steam...";
pub const TASK_DOWNLOADING: &str = "Downloading server files...";
pub const TASK_VALIDATING: &str = "Validating installation...";
pub const TASK_FINALIZING: &str = "Finalizing installation...";

fn update_state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Update state \(0x[0-9a-fA-F]+\) ([A-Za-z ]+?)(?:, progress: (\d+(?:\.\d+)?)|\s*\(|\s*$)")
            .expect("update state pattern is valid")
    })
}

/// Tracks one job's progress across output lines.
#[derive(Debug)]
pub struct ProgressTracker {
    progress: u8,
    task: String,
    last_error: Option<String>,
    tail: VecDeque<String>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            progress: 0,
            task: TASK_STARTING.to_string(),
            last_error: None,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Most recent `ERROR!` / `FAILED` line, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The last few output lines, newest last.
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Remember a line without interpreting it (stderr).
    pub fn record(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.tail.len() >= TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
        if line.contains("ERROR!") || line.contains("FAILED") {
            self.last_error = Some(line.to_string());
        }
    }

    /// Feed one stdout line. Returns true when progress or task changed.
    pub fn observe(&mut self, line: &str) -> bool {
        self.record(line);
        let before = (self.progress, self.task.clone());
        let lower = line.to_lowercase();

        if let Some(caps) = update_state_re().captures(line.trim_end()) {
            let phase = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
            match caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok()) {
                Some(pct) => {
                    let mapped = UPDATE_STATE_BASE + pct.clamp(0.0, 100.0) * UPDATE_STATE_SPAN / 100.0;
                    self.advance_to(mapped.floor() as u8);
                }
                None => self.advance_to(self.progress.saturating_add(5).min(UPDATE_STATE_CAP)),
            }
            self.task = task_for_phase(&phase).to_string();
        } else if lower.contains("success!") {
            self.advance_to(MAX_RUNNING_PROGRESS);
            self.task = TASK_FINALIZING.to_string();
        } else if lower.contains("validating") || lower.contains("verifying") {
            self.task = TASK_VALIDATING.to_string();
        } else if lower.contains("logging in")
            || lower.contains("connecting anonymously")
            || lower.contains("waiting for user info")
        {
            self.advance_to(AUTH_PROGRESS);
            self.task = TASK_AUTH.to_string();
        } else if lower.contains("downloading") {
            if self.progress < DOWNLOADING_CAP {
                self.advance_to(self.progress + 1);
            }
            self.task = TASK_DOWNLOADING.to_string();
        }

        (self.progress, self.task.as_str()) != (before.0, before.1.as_str())
    }

    fn advance_to(&mut self, value: u8) {
        self.progress = self.progress.max(value.min(MAX_RUNNING_PROGRESS));
    }
}

fn task_for_phase(phase: &str) -> &'static str {
    if phase.contains("verif") || phase.contains("validat") {
        TASK_VALIDATING
    } else if phase.contains("prealloc") {
        "Allocating disk space..."
    } else if phase.contains("commit") {
        "Writing server files..."
    } else if phase.contains("download") {
        TASK_DOWNLOADING
    } else {
        "Updating server files..."
    }
}

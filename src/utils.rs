//! Small helpers shared by the installer and the process supervisor.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Command;

/// Longest instance id accepted by the registry.
pub const MAX_ID_LEN: usize = 64;

/// Hide the console window of child processes on Windows.
/// SteamCMD and the dedicated server would otherwise pop up a terminal each.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Give the child its own process group so everything it spawns can be
/// killed together with `supervisor::process::kill_tree`.
#[cfg(not(target_os = "windows"))]
pub fn new_process_group(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

/// `taskkill /T` walks the tree by parent pid; no grouping needed.
#[cfg(target_os = "windows")]
pub fn new_process_group(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Instance ids double as directory names, so only `[A-Za-z0-9_-]` is allowed.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

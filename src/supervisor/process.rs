//! Signal delivery for the two-phase stop and for tearing down installer trees.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Ask the process to exit (SIGTERM / `taskkill` without `/F`).
pub fn request_terminate(pid: u32) -> Result<(), ProcessError> {
    tracing::info!("Sending TERM to pid {}", pid);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            // Console programs often ignore WM_CLOSE; the force phase covers them.
            tracing::debug!(
                "taskkill /PID {} returned {}: {}",
                pid,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }
}

/// Kill the process outright (SIGKILL / `TerminateProcess`).
pub fn force_kill(pid: u32) -> Result<(), ProcessError> {
    tracing::warn!("Sending KILL to pid {}", pid);

    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::NotFound { pid });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }
}

/// Kill `pid` and everything it spawned. On unix `pid` must lead its own
/// process group (`utils::new_process_group`); on Windows `taskkill /T /F`
/// walks the tree.
pub fn kill_tree(pid: u32) -> Result<(), ProcessError> {
    tracing::warn!("Killing process tree of pid {}", pid);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::NotFound { pid })
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        match nix::sys::signal::killpg(Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ProcessError::NotFound { pid }),
            Err(e) => Err(ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

/// Whether the process group led by `pid` still has members, unreaped
/// zombies included.
#[cfg(not(target_os = "windows"))]
pub fn group_exists(pid: u32) -> bool {
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcessError::NotFound { pid }),
        Err(e) => Err(ProcessError::TerminationFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn term_and_kill_reach_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        request_terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        force_kill(child.id()).unwrap();
        assert!(!child.wait().unwrap().success());
    }

    #[test]
    fn missing_pid_is_not_found() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(matches!(force_kill(pid), Err(ProcessError::NotFound { .. })));
    }

    #[test]
    fn kill_tree_reaches_grandchildren() {
        use std::os::unix::process::CommandExt;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let mut leader = std::process::Command::new("/bin/sh")
            .args(["-c", &script])
            .process_group(0)
            .spawn()
            .unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            if let Ok(raw) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = raw.trim().parse::<u32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let grandchild = grandchild.expect("background child started");

        kill_tree(leader.id()).unwrap();
        assert!(!leader.wait().unwrap().success());

        let mut gone = false;
        for _ in 0..100 {
            if !crate::process_monitor::is_running(grandchild) {
                gone = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(gone, "background child {} survived", grandchild);
    }
}

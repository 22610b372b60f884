//! OS process table queries for liveness and resource stats.

use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};

/// Gap between the two refreshes a CPU reading needs.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// One resource reading of a live process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    /// Percent of one core; may exceed 100 on multi-core load.
    pub cpu: f32,
    pub memory_bytes: u64,
}

/// Whether `pid` is alive. Exited but unreaped (zombie) processes count as gone.
pub fn is_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_process(pid)
        && sys
            .process(pid)
            .map_or(false, |p| p.status() != ProcessStatus::Zombie)
}

/// Sample CPU and memory of `pid`. Blocks for `CPU_SAMPLE_INTERVAL`.
/// `None` when the process disappeared in the meantime.
pub fn sample(pid: u32) -> Option<ProcessSample> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    std::thread::sleep(CPU_SAMPLE_INTERVAL);
    if !sys.refresh_process(pid) {
        return None;
    }
    let process = sys.process(pid)?;
    Some(ProcessSample {
        cpu: process.cpu_usage(),
        memory_bytes: process.memory(),
    })
}

/// `sample` on a blocking thread; sysinfo walks the process table synchronously.
pub async fn sample_async(pid: u32) -> Option<ProcessSample> {
    tokio::task::spawn_blocking(move || sample(pid))
        .await
        .ok()
        .flatten()
}

/// Memory figures are reported to clients in MiB.
pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

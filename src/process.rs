use sysinfo::{Pid, ProcessStatus, Signal, System};

/// Whether `pid` names a live (non-zombie) process on this host.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Argument vector of a live process, `None` if it is gone.
pub fn command_line(pid: u32) -> Option<Vec<String>> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return None;
    }
    let process = sys.process(pid)?;
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return None;
    }
    Some(process.cmd().to_vec())
}

/// Send SIGTERM. Returns false when the process does not exist or the
/// signal could not be delivered.
pub fn terminate(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .and_then(|p| p.kill_with(Signal::Term))
        .unwrap_or(false)
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

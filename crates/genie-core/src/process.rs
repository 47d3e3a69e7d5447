//! Process liveness checks used to cross-check a persisted `running` status.

pub trait ProcessProbe {
    /// `None` means no PID was recorded, which counts as dead.
    fn is_alive(&self, pid: Option<u32>) -> bool;
}

/// Probes the local process table with signal 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: Option<u32>) -> bool {
        match pid {
            Some(pid) if pid > 0 => pid_exists(pid),
            _ => false,
        }
    }
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_exists(_pid: u32) -> bool {
    false
}

/// Fixed answers keyed by PID, for callers that already know liveness.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub alive: Vec<u32>,
}

impl ProcessProbe for StaticProbe {
    fn is_alive(&self, pid: Option<u32>) -> bool {
        pid.is_some_and(|pid| self.alive.contains(&pid))
    }
}

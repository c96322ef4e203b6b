//! Process liveness checks.

/// Answers whether a process id currently refers to a running process.
pub trait ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<P: ProcessLiveness + ?Sized> ProcessLiveness for &P {
    fn is_alive(&self, pid: u32) -> bool {
        (**self).is_alive(pid)
    }
}

/// Uses `kill(pid, 0)`, which performs the permission and existence checks
/// without delivering a signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessLiveness for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }

        // SAFETY: signal 0 is never delivered.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }

        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

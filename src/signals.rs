/// Signal handling and forceful termination of a monitored command.
///
/// Commands are spawned in their own process group (`process_group(0)`), so the
/// group id equals the child's pid. Sending SIGKILL to the group also takes down
/// grandchildren started by the shell, which would otherwise keep the output
/// pipes open after the shell itself is gone.
///
/// Because the child is not in the terminal's foreground group, SIGINT and
/// SIGTERM only reach us. `shutdown_signal` waits for either, and the caller
/// kills the group recorded in `ActiveGroup` before exiting.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};

/// Send SIGKILL to every process in the group led by `pid`.
pub fn kill_process_group(pid: u32) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
    killpg(Pid::from_raw(pgid), Signal::SIGKILL)
}

/// Map an exit status to a shell-style exit code.
///
/// A process terminated by signal N reports `128 + N`, the same value a POSIX
/// shell would put in `$?`.
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

/// Process group of the attempt currently running, if any.
///
/// Shared between the session that spawns the child and the shutdown path in
/// `main`.
#[derive(Debug, Clone, Default)]
pub struct ActiveGroup {
    pgid: Arc<Mutex<Option<u32>>>,
}

impl ActiveGroup {
    pub fn set(&self, pgid: u32) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = Some(pgid);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = None;
        }
    }

    pub fn get(&self) -> Option<u32> {
        self.pgid.lock().ok().and_then(|slot| *slot)
    }

    /// Kill the recorded group, if there is one. Returns the group id killed.
    pub fn kill(&self) -> Option<u32> {
        let pgid = self.get()?;
        if let Err(e) = kill_process_group(pgid) {
            tracing::warn!(pgid, error = %e, "failed to kill process group");
        }
        self.clear();
        Some(pgid)
    }
}

/// A termination request received from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    /// Shell-style exit code for dying on this signal.
    pub fn exit_code(self) -> i32 {
        match self {
            Shutdown::Interrupt => 128 + Signal::SIGINT as i32,
            Shutdown::Terminate => 128 + Signal::SIGTERM as i32,
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed, that signal is simply never reported.
pub async fn shutdown_signal() -> Shutdown {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            None
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };

    tokio::select! {
        Some(()) = async { interrupt.as_mut()?.recv().await } => Shutdown::Interrupt,
        Some(()) = async { terminate.as_mut()?.recv().await } => Shutdown::Terminate,
        else => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_exit_codes() {
        assert_eq!(Shutdown::Interrupt.exit_code(), 130);
        assert_eq!(Shutdown::Terminate.exit_code(), 143);
    }

    #[test]
    fn test_active_group_set_and_clear() {
        let group = ActiveGroup::default();
        assert_eq!(group.get(), None);
        group.set(42);
        assert_eq!(group.clone().get(), Some(42));
        group.clear();
        assert_eq!(group.get(), None);
        assert_eq!(group.kill(), None);
    }

    #[tokio::test]
    async fn test_active_group_kill_reaps_tree() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .process_group(0)
            .spawn()
            .unwrap();
        let group = ActiveGroup::default();
        group.set(child.id().unwrap());

        assert_eq!(group.kill(), child.id());
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(9));
        assert_eq!(group.get(), None);
    }

    #[test]
    fn test_exit_code_normal() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), Some(0));
        // Raw wait status encodes the exit code in the high byte.
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), Some(3));
    }

    #[test]
    fn test_exit_code_signal() {
        // Raw wait status of a process killed by SIGKILL (9).
        assert_eq!(exit_code(ExitStatus::from_raw(9)), Some(137));
    }

    #[tokio::test]
    async fn test_kill_process_group_kills_child() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        kill_process_group(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(9));
    }

    #[test]
    fn test_kill_process_group_rejects_oversized_pid() {
        assert_eq!(kill_process_group(u32::MAX), Err(nix::Error::EINVAL));
    }
}

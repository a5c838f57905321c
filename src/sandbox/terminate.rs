//! Process-group termination.
//!
//! [`terminate_process_tree`] is the only shutdown path for a sandboxed
//! run: the timeout branch and the cancellation branch both call it, so the
//! two can never diverge.

use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SandboxError;

/// Poll interval while waiting for a signalled group to drain.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Sends `signal` to every member of process group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pgid: i32, signal: Signal) -> Result<bool, SandboxError> {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SandboxError::Signal {
            pgid,
            message: e.to_string(),
        }),
    }
}

/// Returns true while at least one process is still a member of `pgid`.
pub fn group_alive(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH))
}

/// Immediately SIGKILLs the whole group. Used by synchronous cleanup paths
/// (lease drop, registry shutdown) that cannot wait out a grace interval.
pub fn kill_group_now(pgid: i32) -> bool {
    match signal_group(pgid, Signal::SIGKILL) {
        Ok(hit) => hit,
        Err(e) => {
            warn!(pgid, error = %e, "SIGKILL to process group failed");
            false
        }
    }
}

/// Two-phase shutdown of the process tree rooted at `child`.
///
/// SIGTERM goes to the whole group, then the group gets up to `grace` to
/// drain. SIGKILL is sent to the group afterwards regardless, which sweeps
/// descendants that ignored SIGTERM or outlived the leader. The leader is
/// reaped before returning.
pub async fn terminate_process_tree(
    pgid: i32,
    child: &mut Child,
    grace: Duration,
) -> Result<ExitStatus, SandboxError> {
    debug!(pgid, ?grace, "Sending SIGTERM to process group");
    signal_group(pgid, Signal::SIGTERM)?;

    let deadline = Instant::now() + grace;
    let mut leader_status = None;
    loop {
        if leader_status.is_none() {
            leader_status = child.try_wait()?;
        }
        if leader_status.is_some() && !group_alive(pgid) {
            debug!(pgid, "Process group exited within grace interval");
            break;
        }
        if Instant::now() >= deadline {
            warn!(pgid, "Process group still alive after grace interval, sending SIGKILL");
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    signal_group(pgid, Signal::SIGKILL)?;

    match leader_status {
        Some(status) => Ok(status),
        None => Ok(child.wait().await?),
    }
}

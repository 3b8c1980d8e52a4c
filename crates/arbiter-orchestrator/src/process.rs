//! Node process lifecycle: spawn, liveness probe, termination.
//!
//! Nodes are external executables launched from their manifest and detached
//! into their own session. Termination is staged: SIGTERM, a bounded wait,
//! then SIGKILL, followed by a reap so no zombie lingers in the process
//! table.

// This module owns the process-management OS boundary.
#![allow(unsafe_code)]

use crate::manifest::NodeManifest;
use arbiter_core::{ArbiterError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Spawn a node per its manifest and return the pid.
///
/// The child is detached into its own session so terminal signals aimed at
/// the orchestrator never reach it; stopping a node is always the explicit
/// `terminate_process` ladder. The returned pid is the only handle kept;
/// exits are reaped through `is_process_alive`.
pub fn spawn_node_process(manifest: &NodeManifest) -> Result<u32> {
    if manifest.runtime.command.is_empty() {
        return Err(ArbiterError::Config {
            message: format!("node {} has no runtime.command", manifest.id),
        });
    }

    let mut command = Command::new(&manifest.runtime.command);
    command
        .args(&manifest.runtime.args)
        .envs(&manifest.runtime.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &manifest.runtime.working_dir {
        command.current_dir(dir);
    }

    // SAFETY: setsid is async-signal-safe and runs in the forked child
    // before exec; the closure does not allocate or touch locks.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| ArbiterError::SpawnFailed {
        id: manifest.id.clone(),
        message: e.to_string(),
    })?;

    let pid = child.id();
    info!("Spawned node {} (pid {})", manifest.id, pid);
    Ok(pid)
}

/// Check whether a process with the given pid is alive.
///
/// Reaps the exit status first when the pid is one of our children, so a
/// crashed node reads as dead instead of lingering as a zombie; otherwise
/// falls back to a `kill(pid, 0)` probe.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let nix_pid = Pid::from_raw(pid as i32);

    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(status) => {
            debug!("Reaped process {}: {:?}", pid, status);
            false
        }
        // Not our child (ECHILD) or already collected; probe with signal 0.
        Err(_) => kill(nix_pid, None).is_ok(),
    }
}

/// Terminate a process gracefully, then forcefully if needed.
///
/// Sends SIGTERM, waits up to `kill_wait` in 100 ms steps, escalates to
/// SIGKILL, and reaps the exit status. Returns `Ok(true)` when the process
/// is confirmed gone (including when it was never running).
pub async fn terminate_process(pid: u32, kill_wait: Duration) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    let nix_pid = Pid::from_raw(pid as i32);

    // First try SIGTERM (graceful)
    debug!("Sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (kill_wait.as_millis() as u64 / 100).max(1);

    for _ in 0..iterations {
        tokio::time::sleep(wait_interval).await;
        if !is_process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    // Process still running, use SIGKILL
    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        return Err(ArbiterError::Other(format!(
            "Failed to kill process {}: {}",
            pid, e
        )));
    }

    // Brief wait, then collect the exit status so the zombie leaves the
    // process table.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("Reaped process {}: {:?}", pid, status),
        Err(e) => {
            // ECHILD means we are not the parent; init reaps it.
            if e != Errno::ECHILD {
                debug!("waitpid({}) failed: {}", pid, e);
            }
        }
    }

    Ok(!is_process_alive(pid))
}

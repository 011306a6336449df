//! OS process table helpers.
//!
//! The supervisor owns the `Child` handles it spawned, but two situations
//! force us to reason about raw pids: sessions inherited from a previous
//! host process (the registry is empty after a restart) and orphaned
//! encoder processes that no Session row claims. On Unix these helpers
//! read `/proc` and signal with `nix`; on other platforms they degrade to
//! "unknown", which makes the health monitor treat such sessions as dead.

use std::time::Duration;

/// Returns whether a process with the given pid currently exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 performs the permission/existence check without delivering.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Returns the short image name (`comm`) of a process, if it exists.
#[cfg(unix)]
pub fn pid_image_name(pid: u32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    Some(comm.trim_end().to_string())
}

#[cfg(not(unix))]
pub fn pid_image_name(_pid: u32) -> Option<String> {
    None
}

/// Returns whether the pid exists and its image name contains `name`.
///
/// Used to verify that a pid persisted in a Session row still belongs to an
/// encoder process and was not recycled by the OS for something else.
pub fn pid_is_process(pid: u32, name: &str) -> bool {
    match pid_image_name(pid) {
        Some(image) => image.to_lowercase().contains(&name.to_lowercase()),
        None => false,
    }
}

/// Enumerates all pids whose image name contains `name`.
#[cfg(unix)]
pub fn list_pids_by_name(name: &str) -> Vec<u32> {
    let needle = name.to_lowercase();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let image = pid_image_name(pid)?;
            image.to_lowercase().contains(&needle).then_some(pid)
        })
        .collect()
}

#[cfg(not(unix))]
pub fn list_pids_by_name(_name: &str) -> Vec<u32> {
    Vec::new()
}

/// Sends SIGTERM to a process. Returns `true` if the signal was delivered
/// or the process was already gone.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> bool {
    false
}

/// Sends SIGKILL to a process. Returns `true` if the signal was delivered
/// or the process was already gone.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) -> bool {
    false
}

/// Terminates a pid with escalation: SIGTERM, wait up to `grace`, SIGKILL.
///
/// Returns `true` once the process is gone.
pub async fn kill_with_grace(pid: u32, grace: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }

    if !terminate_pid(pid) {
        return false;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    log::warn!("[OS] Process {} ignored SIGTERM, sending SIGKILL", pid);
    if !kill_pid(pid) {
        return false;
    }
    // SIGKILL cannot be ignored; give the kernel a moment to reap.
    tokio::time::sleep(Duration::from_millis(100)).await;
    !pid_alive(pid)
}

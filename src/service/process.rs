//! OS process helpers for agent processes we may not own a handle to
//! (recorded PIDs from a previous orchestrator, orphans found by a sweep).

use std::time::Duration;

/// Check if a process is still running
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 only checks existence
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    // Can't check; assume alive
    true
}

/// Kernel start time of `pid` in clock ticks since boot. A recycled pid
/// reports a different value, so (pid, start time) names one process.
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces or parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    // `rest` starts at field 3 (state); starttime is field 22
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// Whether `pid` still names the process recorded with `start_time`.
/// False when either side is unknown.
pub fn is_same_process(pid: u32, start_time: Option<u64>) -> bool {
    match (start_time, process_start_time(pid)) {
        (Some(recorded), Some(current)) => recorded == current,
        _ => false,
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    if unsafe { libc::kill(pid as i32, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL if still alive.
/// Returns true if the process had to be killed.
#[cfg(unix)]
pub async fn terminate_pid(pid: u32, grace: Duration) -> std::io::Result<bool> {
    if !is_process_alive(pid) {
        return Ok(false);
    }
    send_signal(pid, libc::SIGTERM)?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !is_process_alive(pid) {
            return Ok(false);
        }
    }

    send_signal(pid, libc::SIGKILL)?;
    Ok(true)
}

#[cfg(not(unix))]
pub async fn terminate_pid(_pid: u32, _grace: Duration) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process termination is only supported on Unix systems",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_start_time_identifies_process() {
        let pid = std::process::id();
        let start = process_start_time(pid);
        assert!(start.is_some());
        assert!(is_same_process(pid, start));
        assert!(!is_same_process(pid, start.map(|t| t + 1)));
        assert!(!is_same_process(pid, None));
    }

    #[tokio::test]
    async fn test_terminate_sleeping_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Reap concurrently so the pid doesn't linger as a zombie
        let waiter = tokio::spawn(async move { child.wait().await });

        let killed = terminate_pid(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!killed, "sleep should exit on SIGTERM");
        let status = waiter.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_missing_pid_is_ok() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!terminate_pid(pid, Duration::from_millis(200)).await.unwrap());
    }
}

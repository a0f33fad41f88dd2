//! Child process teardown shared by stdio providers and the process launcher.

use std::time::Duration;

use tokio::process::Child;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How a child ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before we asked.
    AlreadyExited,
    /// The process exited within the grace period.
    Graceful,
    /// The process ignored termination and was killed.
    Killed,
}

/// Terminate `child`, then force-kill it once `grace` has elapsed.
///
/// Always reaps the child before returning `Ok`, so no zombie is left behind.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<Termination> {
    if child.try_wait()?.is_some() {
        return Ok(Termination::AlreadyExited);
    }

    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(Termination::Graceful),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!(
                pid = ?child.id(),
                grace_ms = grace.as_millis() as u64,
                "child ignored termination, killing"
            );
            // kill() sends SIGKILL and waits for the exit status.
            child.kill().await?;
            Ok(Termination::Killed)
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid = raw, error = %e, "SIGTERM delivery failed");
    }
}

// No portable SIGTERM: fall straight through to the grace wait, then kill.
#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_terminate_running_child_is_graceful() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let outcome = terminate_child(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, Termination::Graceful);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_kills_child_ignoring_sigterm() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.05; done")
            .spawn()
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = terminate_child(&mut child, Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, Termination::Killed);
    }

    #[tokio::test]
    async fn test_terminate_exited_child() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let outcome = terminate_child(&mut child, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Termination::AlreadyExited);
    }
}

//! Collaborators invoked when a run wraps up.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_SHUTDOWN_DELAY_SECS: u64 = 15;

/// Platform command that powers the machine off.
pub fn default_shutdown_command() -> Vec<String> {
    let parts: &[&str] = if cfg!(windows) {
        &["shutdown", "/s", "/t", "0"]
    } else {
        &["shutdown", "-h", "now"]
    };
    parts.iter().map(|part| (*part).to_owned()).collect()
}

pub trait CompletionHooks: Send + Sync {
    /// Wakes the display so the user sees the result. Called after every run.
    fn wake_screen(&self);

    /// Counts down and shuts the machine down unless cancelled. Returns true
    /// when the shutdown command was issued.
    fn shutdown(&self) -> bool;
}

/// Cancels a pending shutdown countdown from any thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn rearm(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Logs once per tick for `ticks` ticks. Returns false as soon as `handle` is
/// cancelled.
pub fn run_countdown(ticks: u64, tick: Duration, handle: &ShutdownHandle) -> bool {
    for remaining in (1..=ticks).rev() {
        if handle.is_cancelled() {
            tracing::info!("shutdown cancelled");
            return false;
        }
        tracing::info!(remaining, "shutting down in {remaining}s");
        thread::sleep(tick);
    }
    if handle.is_cancelled() {
        tracing::info!("shutdown cancelled");
        return false;
    }
    true
}

/// Runs configured commands on the host.
#[derive(Debug, Clone)]
pub struct SystemHooks {
    pub wake_command: Option<Vec<String>>,
    pub shutdown_command: Vec<String>,
    pub shutdown_delay: u64,
    pub tick: Duration,
    handle: ShutdownHandle,
}

impl SystemHooks {
    pub fn new(
        wake_command: Option<Vec<String>>,
        shutdown_command: Vec<String>,
        shutdown_delay: u64,
    ) -> Self {
        Self {
            wake_command,
            shutdown_command,
            shutdown_delay,
            tick: Duration::from_secs(1),
            handle: ShutdownHandle::default(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }
}

impl CompletionHooks for SystemHooks {
    fn wake_screen(&self) {
        let Some(command) = &self.wake_command else {
            tracing::debug!("no wake command configured");
            return;
        };
        if let Err(error) = run_command(command) {
            tracing::warn!(%error, "wake command failed");
        }
    }

    fn shutdown(&self) -> bool {
        self.handle.rearm();
        if !run_countdown(self.shutdown_delay, self.tick, &self.handle) {
            return false;
        }
        match run_command(&self.shutdown_command) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(%error, "shutdown command failed");
                false
            }
        }
    }
}

fn run_command(argv: &[String]) -> std::io::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::other("empty command"));
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("{program} exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn countdown_completes_when_not_cancelled() {
        let handle = ShutdownHandle::default();
        assert!(run_countdown(3, Duration::from_millis(1), &handle));
    }

    #[test]
    fn countdown_stops_once_cancelled() {
        let handle = ShutdownHandle::default();
        let canceller = handle.clone();
        let worker = thread::spawn(move || run_countdown(200, Duration::from_millis(10), &handle));
        thread::sleep(Duration::from_millis(30));
        canceller.cancel();

        let begun = Instant::now();
        assert!(!worker.join().expect("countdown thread"));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_runs_command_after_countdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("shutdown");
        let mut hooks = SystemHooks::new(
            None,
            vec![
                String::from("touch"),
                marker.to_string_lossy().to_string(),
            ],
            2,
        );
        hooks.tick = Duration::from_millis(1);
        assert!(hooks.shutdown());
        assert!(marker.exists());
    }

    #[test]
    fn cancelled_shutdown_never_runs_command() {
        let mut hooks = SystemHooks::new(None, vec![String::from("/nonexistent/shutdown")], 50);
        hooks.tick = Duration::from_millis(5);
        let handle = hooks.shutdown_handle();
        let worker = thread::spawn(move || hooks.shutdown());
        thread::sleep(Duration::from_millis(20));
        handle.cancel();
        assert!(!worker.join().expect("shutdown thread"));
    }

    #[test]
    fn empty_wake_command_is_reported() {
        assert!(run_command(&[]).is_err());
    }
}

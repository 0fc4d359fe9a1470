//! Shutdown Coordinator (C10): traps termination signals and drives the
//! `Running` → `Draining` → `Stopped` state machine.
//!
//! A `tokio::sync::watch` channel dispatches the shutdown state to every
//! subscriber, rather than doing the drain work inside the signal handler
//! itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

pub struct ShutdownCoordinator {
    tx: watch::Sender<ShutdownState>,
    rx: watch::Receiver<ShutdownState>,
    draining_started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        Arc::new(Self { tx, rx, draining_started: AtomicBool::new(false) })
    }

    pub fn state(&self) -> ShutdownState {
        *self.rx.borrow()
    }

    pub fn is_draining_or_stopped(&self) -> bool {
        !matches!(self.state(), ShutdownState::Running)
    }

    /// Move to `Draining`. Idempotent: a second signal does not restart
    /// the drain.
    pub fn begin_drain(&self) {
        if !self.draining_started.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown: draining");
            let _ = self.tx.send(ShutdownState::Draining);
        }
    }

    pub fn mark_stopped(&self) {
        tracing::info!("shutdown: stopped");
        let _ = self.tx.send(ShutdownState::Stopped);
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.rx.clone()
    }

    /// Wait for SIGTERM or Ctrl-C (the framework-native equivalent on
    /// platforms without signals would plug in here) and move to
    /// `Draining`. Spawned once by `init`.
    #[cfg(unix)]
    pub async fn watch_os_signals(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => self.begin_drain(),
            _ = tokio::signal::ctrl_c() => self.begin_drain(),
        }
    }

    #[cfg(not(unix))]
    pub async fn watch_os_signals(self: Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_ok() {
            self.begin_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::new();
        assert_eq!(coord.state(), ShutdownState::Running);
        assert!(!coord.is_draining_or_stopped());
    }

    #[test]
    fn begin_drain_is_idempotent() {
        let coord = ShutdownCoordinator::new();
        coord.begin_drain();
        coord.begin_drain();
        assert_eq!(coord.state(), ShutdownState::Draining);
    }

    #[test]
    fn mark_stopped_transitions_from_draining() {
        let coord = ShutdownCoordinator::new();
        coord.begin_drain();
        coord.mark_stopped();
        assert_eq!(coord.state(), ShutdownState::Stopped);
    }
}

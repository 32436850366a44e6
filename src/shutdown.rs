//! Shutdown and reload signalling for the daemons.
//!
//! SIGINT/SIGTERM/SIGQUIT request a graceful shutdown; SIGHUP requests a
//! ring reload without stopping the daemon loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::info;

/// Coordinates shutdown and reload requests between the signal handler and
/// the daemon loop.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
    reload: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);
        Self {
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(Notify::new()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
        }
    }

    /// Wait for shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Ask the daemon loop to reload its rings.
    ///
    /// A request made while nobody waits is kept until the next wait.
    pub fn request_reload(&self) {
        self.reload.notify_one();
    }

    pub async fn wait_for_reload(&self) {
        self.reload.notified().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates OS signals into coordinator requests.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Install signal handlers and run until a shutdown signal arrives.
    #[cfg(unix)]
    pub async fn run(self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigquit.recv() => {
                    info!("Received SIGQUIT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP; reloading rings");
                    self.coordinator.request_reload();
                }
            }
        }

        self.coordinator.shutdown();
        Ok(())
    }

    #[cfg(windows)]
    pub async fn run(self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        self.coordinator.shutdown();
        Ok(())
    }
}

//! Stop signal for the controller and the per-deployment loops.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Stop flag shared by clones. Once raised it stays raised.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    stop: Arc<watch::Sender<bool>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Raise the flag. Returns false if it was already raised.
    pub fn shutdown(&self) -> bool {
        self.stop.send_if_modified(|stopped| !std::mem::replace(stopped, true))
    }

    /// Resolves once the flag is raised. Usable as a `select!` branch.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Raise `coordinator` on SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn wait_for_signal(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    info!(signal = name, "Stopping operator");
    coordinator.shutdown();
    Ok(())
}

/// Raise `coordinator` on Ctrl+C.
#[cfg(not(unix))]
pub async fn wait_for_signal(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "Stopping operator");
    coordinator.shutdown();
    Ok(())
}

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Graceful and fast shutdown requests, observed by the scheduler core.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    graceful: CancellationToken,
    fast: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_graceful(&self) {
        self.graceful.cancel();
    }

    /// A fast shutdown implies a graceful one.
    pub fn request_fast(&self) {
        self.graceful.cancel();
        self.fast.cancel();
    }

    pub fn graceful(&self) -> &CancellationToken {
        &self.graceful
    }

    pub fn fast(&self) -> &CancellationToken {
        &self.fast
    }
}

/// Install a shutdown handler for SIGTERM, SIGINT and SIGQUIT.
///
/// The first SIGTERM or SIGINT requests a graceful shutdown; a second one,
/// or SIGQUIT at any time, escalates to a fast shutdown.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownSignal> {
    let shutdown = ShutdownSignal::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let handle = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let escalate = tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    handle.graceful.is_cancelled()
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    handle.graceful.is_cancelled()
                }
                _ = sigquit.recv() => {
                    tracing::info!("Received SIGQUIT");
                    true
                }
            };
            if escalate {
                tracing::warn!("Initiating fast shutdown");
                handle.request_fast();
                break;
            }
            tracing::info!("Initiating graceful shutdown");
            handle.request_graceful();
        }
    });

    Ok(shutdown)
}

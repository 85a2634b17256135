//! Shutdown signalling for the node process

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Cloneable shutdown flag; every clone observes the same trigger
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once [`ShutdownSignal::shutdown`] was called, also if that
    /// happened before the call
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives in self, so this only fails after a trigger
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `signal` on Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and ignored; the other one
/// still works.
pub fn listen_for_os_signals(signal: ShutdownSignal) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down node..."),
            _ = terminate => info!("Received SIGTERM, shutting down node..."),
        }

        signal.shutdown();
    });
}

/// Run `future` until it completes or `signal` fires; `None` when cancelled
pub async fn run_with_shutdown<F, T>(future: F, signal: &ShutdownSignal) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = signal.wait() => None,
    }
}

/// Bound a cleanup step so a hung peer cannot keep the process alive
pub async fn with_deadline<F>(what: &str, deadline: Duration, future: F)
where
    F: std::future::Future<Output = ()>,
{
    if tokio::time::timeout(deadline, future).await.is_err() {
        warn!("{} did not finish within {:?}", what, deadline);
    }
}

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. If a handler cannot be installed the error is logged and only
/// the other signal is watched.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                None
            }
        };
        if sigterm.is_none() && sigint.is_none() {
            return;
        }

        tokio::select! {
            Some(_) = recv(&mut sigterm) => {
                tracing::info!("Received SIGTERM, shutting down cluster");
            }
            Some(_) = recv(&mut sigint) => {
                tracing::info!("Received SIGINT, shutting down cluster");
            }
            else => return,
        }

        token_clone.cancel();
    });

    token
}

async fn recv(sig: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match sig {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

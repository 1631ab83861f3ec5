use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT and cancel the returned token on either.
///
/// The refresh loop, the eviction loop and the HTTP server all watch this
/// token; the server finishes in-flight requests before returning.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Shutting down captcha dispatcher");
        trigger.cancel();
    });

    Ok(token)
}

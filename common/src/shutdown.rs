use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Hands out a token that is cancelled when the process is asked to stop:
/// SIGTERM from the kubelet, or an interactive interrupt. Every component
/// task in this workspace selects on the token rather than on raw signals,
/// so a single listener fans the request out to all of them.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let cause = wait_for_stop_request().await;
        eprintln!("{}", format!("🛑 {cause}; shutting down").red());
        trigger.cancel();
    });
    token
}

async fn wait_for_stop_request() -> &'static str {
    #[cfg(unix)]
    let terminated = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "Interrupted",
        _ = terminated => "Received SIGTERM",
    }
}

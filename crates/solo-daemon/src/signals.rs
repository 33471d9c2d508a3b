use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::controller::DaemonController;

static SIGNALS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Register SIGINT/SIGTERM handlers that run a graceful `stop()` before
/// the process exits.
///
/// Registration is once-guarded: later calls are no-ops, so `restart()`
/// cycles never stack duplicate handlers.
pub fn register_signal_handlers(controller: Arc<DaemonController>) {
    if SIGNALS_REGISTERED.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async move {
        let signal_name = wait_for_shutdown_signal().await;
        info!(signal = signal_name, "shutdown signal received, stopping daemon");
        if !controller.stop().await {
            warn!("graceful stop did not complete cleanly");
        }
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

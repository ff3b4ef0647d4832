//! Listener lifecycle

use std::future::Future;
use std::net::SocketAddr;

use remocard_apdu_transport_pcsc::event::EventReceiver;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend;
use crate::config::SettingsStore;
use crate::router::router;
use crate::state::AppState;

/// Probe the backend, detect slots and serve until Ctrl-C or SIGTERM
pub async fn run(settings: SettingsStore) -> eyre::Result<()> {
    let backend = backend::probe();
    let state = AppState::new(backend.service, settings);
    let addr = state.settings().snapshot().socket_addr();

    let refresh = state.clone();
    // Detached; later refreshes replace its result
    drop(tokio::task::spawn_blocking(move || refresh.refresh_slots()));
    let watcher = backend
        .monitor
        .as_ref()
        .map(|monitor| watch_slots(state.clone(), monitor.events()));

    let listener = TcpListener::bind(addr).await?;
    serve(state, listener, shutdown_signal()).await?;

    // Stopping the monitor disconnects the watcher
    drop(backend.monitor);
    if let Some(watcher) = watcher {
        watcher.await?;
    }
    Ok(())
}

/// Serve on `listener` until `shutdown` resolves, then close every channel and
/// session and release the backend
pub async fn serve<F>(state: AppState, listener: TcpListener, shutdown: F) -> eyre::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state.clone());
    info!(addr = %listener.local_addr()?, "Bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("Shutting down");
    tokio::task::spawn_blocking(move || state.shutdown()).await?;
    info!("Bridge stopped");
    Ok(())
}

/// Refresh slot detection on every monitor event
///
/// Events arriving while a refresh runs are folded into the next one.
fn watch_slots(state: AppState, events: EventReceiver) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = events.recv() {
            let pending = events.try_iter().count();
            debug!(?event, pending, "Refreshing slots");
            state.refresh_slots();
        }
        debug!("Slot watcher stopped");
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

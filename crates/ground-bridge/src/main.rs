//! Entry point: loads configuration, initializes logging, wires up the
//! coordinator/RTC handler/application state, serves the local HTTP
//! surface, and starts the signaling session once a start key is available.

mod config;
mod coordinator;
mod credential;
mod drone;
mod error;
mod logging;
mod peer_registry;
mod rtc_handler;
mod signaling;
mod state;
mod supervisor;
mod video_framer;
mod web;

use coordinator::RoutineCoordinator;
use credential::{CredentialStore, KeyringCredentialStore};
use rtc_handler::RtcHandler;
use signaling::SignalingContext;
use state::ApplicationState;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // rustls 0.23 requires an explicit process-wide crypto provider before any
    // TLS handshake (the wss:// signaling socket, the https:// ticket fetch).
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut bridge_config = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config::apply_cli_overrides(&mut bridge_config, std::env::args().skip(1)) {
        eprintln!("fatal configuration error: {e}");
        std::process::exit(1);
    }
    let bridge_config = Arc::new(bridge_config);

    let _logging_guard = logging::init_logging(&bridge_config.logging);
    info!(port = bridge_config.local_http.port, "ground-bridge starting");

    let app_state = ApplicationState::new();
    let coordinator = RoutineCoordinator::new();
    let rtc_handler = RtcHandler::new();

    let router = web::build_router(Arc::clone(&app_state));
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", bridge_config.local_http.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind local HTTP surface: {e}");
            std::process::exit(1);
        }
    };
    let http_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("local HTTP surface exited: {e}");
        }
    });

    let credential_store: Arc<dyn CredentialStore> = Arc::new(KeyringCredentialStore);
    let access_token = match credential_store.load_access_token() {
        Ok(token) => token,
        Err(e) => {
            warn!("failed to read stored access token: {e}");
            None
        }
    };
    app_state.set_access_key(access_token).await;

    let signaling_ctx = Arc::new(SignalingContext {
        config: Arc::clone(&bridge_config),
        app_state: Arc::clone(&app_state),
        coordinator: Arc::clone(&coordinator),
        rtc_handler: Arc::clone(&rtc_handler),
        http: reqwest::Client::new(),
    });

    // A production deployment receives `startApp`/start key via the cloud
    // pairing flow; this session starts immediately against the configured
    // endpoint once a start key has been minted and stored locally.
    if let Some(start_key) = app_state.start_key().await {
        tokio::spawn(signaling::start_app_from(signaling_ctx, start_key));
    } else {
        info!("no start key stored; waiting for the local UI to provide one before signaling starts");
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    coordinator.stop().await;
    coordinator.wait_until_released().await;
    http_server.abort();
}

//!
//! Service shell
//! -------------
//! Wires `Store`, `WsListener`, and the HTTP router behind one Axum
//! `Router`, mobilizes the Store, binds plaintext or TLS depending on the
//! store file's `Configuration.SslCertificate`/`SslKey`, and installs the
//! `ctrl_c` shutdown hook that demobilizes the Store and closes every live
//! WS session.
//!
//! Grounded on `clarium::server::run_with_ports`'s overall shape (startup
//! logging, background task spawns, `Router`/`axum::serve` bring-up,
//! `src/server.rs`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::http;
use crate::store::StoreHandle;
use crate::ws::{self, WsConfig, WsListener};

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub clock: Arc<dyn Clock>,
    pub http: reqwest::Client,
    pub ws: WsListener,
}

/// Mobilize the Store at `store_path` and run the service until a
/// `ctrl_c` signal arrives. Returns once the Store has been demobilized
/// and every WS session closed.
pub async fn run(store_path: PathBuf) -> AppResult<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = StoreHandle::new();
    store.mobilize(&store_path, clock.clone())?;

    let config = Config::from_document(&store.get(&[], &Default::default()));
    let ws_config = WsConfig {
        max_frame_size: config.web_socket_max_frame_size as usize,
        authentication_timeout: config.web_socket_authentication_timeout,
        close_linger: config.web_socket_close_linger,
    };

    let state = AppState {
        store: store.clone(),
        clock: clock.clone(),
        http: reqwest::Client::new(),
        ws: WsListener::new(clock.clone(), ws_config),
    };

    let app: Router<()> = Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .merge(http::router())
        .with_state(state.clone());

    let port = config.http.port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let result = match (&config.ssl_certificate, &config.ssl_key) {
        (Some(cert), Some(key)) => serve_tls(app, addr, cert, key).await,
        _ => serve_plaintext(app, addr).await,
    };

    info!("shutdown requested; demobilizing store and closing live sessions");
    state.ws.close_all();
    store.demobilize();

    result
}

async fn serve_plaintext(app: Router<()>, addr: SocketAddr) -> AppResult<()> {
    info!("binding plaintext HTTP on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::setup("bind_failed".to_string(), e.to_string()))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(ctrl_c())
        .await
        .map_err(|e| AppError::internal("serve_failed".to_string(), e.to_string()))
}

async fn serve_tls(app: Router<()>, addr: SocketAddr, cert: &str, key: &str) -> AppResult<()> {
    info!("binding TLS HTTPS on {addr}");
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| AppError::setup("tls_config_failed".to_string(), e.to_string()))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        ctrl_c().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| AppError::internal("serve_failed".to_string(), e.to_string()))
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl_c handler: {e}");
    }
}

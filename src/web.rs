// src/web.rs
use crate::config::AppConfig;
use crate::connection::Connection;
use crate::handshake::OriginGate;
use crate::hub::{Client, Hub};
use crate::mailbox::{mailbox, DropPolicy};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch::Receiver as WatchReceiver;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Shared application state for the web server.
#[derive(Debug, Clone)]
pub struct AppState {
    hub: Hub,
    gate: OriginGate,
    mailbox_capacity: usize,
    drop_policy: DropPolicy,
    static_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(app_config: &AppConfig, hub: Hub) -> Self {
        Self {
            hub,
            gate: OriginGate::new(app_config.trusted_host.clone()),
            mailbox_capacity: app_config.mailbox_capacity,
            drop_policy: app_config.drop_policy,
            static_path: app_config.static_path.clone(),
        }
    }
}

/// Handles incoming WebSocket upgrade requests.
///
/// The Origin check runs before anything is allocated for the client. Refused
/// requests get a 403 and never reach the hub.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(rejection) = state.gate.admit(&headers) {
        warn!("Refused WebSocket upgrade: {}", rejection);
        return rejection.into_response();
    }

    let (mailbox_tx, mailbox_rx) = mailbox(state.mailbox_capacity, state.drop_policy);
    let client = Client::new(state.hub.next_client_id(), mailbox_tx);
    let connection = Connection::new(client, mailbox_rx, state.hub.clone());
    info!(client = %connection.id(), "Accepted WebSocket connection request.");
    ws.on_upgrade(move |socket| connection.run(socket))
}

/// Serves the built-in viewer page.
async fn serve_home() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

/// Builds the router: `/ws` for WebSocket clients, static assets everywhere else.
///
/// With a configured static directory every other path is served from it,
/// directories resolving to their `index.html`. Without one, `/` serves the
/// built-in viewer and everything else is a 404.
pub fn router(state: AppState) -> Router {
    let router = Router::new().route("/ws", get(websocket_handler));
    let router = match state.static_path.as_deref() {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router.route("/", get(serve_home)),
    };
    router.with_state(Arc::new(state))
}

/// Serves the router on an already-bound listener until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    info!("Web server starting on http://{}", listener.local_addr()?);

    let mut shutdown = shutdown_signal.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Web server shutting down gracefully.");
    })
    .await?;

    info!("Web server stopped.");
    Ok(())
}

/// Binds the configured address and serves the hub's WebSocket endpoint and the
/// static assets.
///
/// # Returns
/// Returns `Ok(())` when the server shuts down cleanly, or an error if the
/// address is invalid or cannot be bound.
pub async fn start_server(
    app_config: Arc<AppConfig>,
    hub: Hub,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let socket_addr: SocketAddr = app_config.web_addr.parse()?;
    if let Some(path) = &app_config.static_path {
        if !path.is_dir() {
            warn!("Static path {} is not a directory.", path.display());
        }
    }
    info!(
        "Admitting WebSocket origins with host {:?}.",
        app_config.trusted_host
    );
    let listener = TcpListener::bind(socket_addr).await?;
    serve(listener, AppState::new(&app_config, hub), shutdown_signal).await
}

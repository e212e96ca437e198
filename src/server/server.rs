//! Router assembly and the TCP accept loop.
//!
//! Connections are sniffed before HTTP parsing: Icecast `SOURCE` requests
//! go to the raw-socket ingest path, everything else is served by hyper.

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use super::requests_logging::log_requests;
use super::routes::route_studio_request;
use super::state::ServerState;
use crate::stream::handle_source_socket;
use hyper_util::rt::TokioIo;

const SNIFF_TIMEOUT: Duration = Duration::from_secs(2);
const SOURCE_PREFIX: &[u8] = b"SOURCE ";

#[derive(Serialize)]
struct ServerStats {
    uptime: String,
    studios: Vec<String>,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        studios: state.manager.list_studios(),
    })
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/studio/{*rest}", any(route_studio_request))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

/// True when the connection opens with an Icecast `SOURCE ` request line.
async fn is_source_connection(socket: &TcpStream) -> bool {
    let mut buf = [0u8; SOURCE_PREFIX.len()];
    loop {
        match socket.peek(&mut buf).await {
            Ok(0) => return false,
            Ok(n) => {
                let n = n.min(SOURCE_PREFIX.len());
                if buf[..n] != SOURCE_PREFIX[..n] {
                    return false;
                }
                if n == SOURCE_PREFIX.len() {
                    return true;
                }
                // Partial prefix; wait for more bytes to arrive.
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(_) => return false,
        }
    }
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    cancel: CancellationToken,
) -> Result<()> {
    let manager = state.manager.clone();
    let app = make_app(state);
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        let (socket, remote_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            },
        };

        let sniffed = tokio::time::timeout(SNIFF_TIMEOUT, is_source_connection(&socket)).await;
        if matches!(sniffed, Ok(true)) {
            let manager = manager.clone();
            tokio::spawn(handle_source_socket(socket, remote_addr, manager));
            continue;
        }

        let tower_service = match make_service.call(remote_addr).await {
            Ok(service) => service,
            Err(infallible) => match infallible {},
        };
        tokio::spawn(async move {
            let socket = TokioIo::new(socket);
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    tower_service.clone().oneshot(request)
                });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(socket, hyper_service)
                .await
            {
                debug!("connection from {} ended with error: {:?}", remote_addr, err);
            }
        });
    }

    info!("server: accept loop stopped");
    Ok(())
}

/// Binds the listen socket and serves until cancelled. A failed bind is the
/// one fatal startup error.
pub async fn run_server(addr: &str, state: ServerState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listen socket {}", addr))?;
    info!("listening on {}", addr);
    serve(listener, state, cancel).await
}

//! Per-studio request dispatch: `/studio/{id}/{action}`.

use super::listen::handle_listen;
use super::state::ServerState;
use crate::analytics::StudioSnapshot;
use crate::stream::{collect_sessions, handle_live_http, LiveMeta, Studio, Track};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Serialize)]
struct TrackInfo {
    id: String,
    file: String,
    title: String,
    artist: String,
    album: String,
    duration_sec: f64,
}

impl From<Track> for TrackInfo {
    fn from(track: Track) -> Self {
        Self {
            id: track.id,
            file: track.file,
            title: track.title,
            artist: track.artist,
            album: track.album,
            duration_sec: track.duration_sec,
        }
    }
}

#[derive(Debug, Serialize)]
struct NowPlayingResponse {
    playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<TrackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<TrackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    live: Option<LiveMeta>,
}

fn now_playing_response(studio: &Studio) -> NowPlayingResponse {
    let live = studio.live_meta();
    match studio.autodj().now_playing() {
        Some(now) => {
            let elapsed = (Utc::now() - now.started_at).num_milliseconds() as f64 / 1000.0;
            NowPlayingResponse {
                playing: true,
                current: Some(now.current.into()),
                next: now.next.map(Into::into),
                started_at: Some(now.started_at),
                elapsed_sec: Some(elapsed.max(0.0)),
                live,
            }
        }
        None => NowPlayingResponse {
            playing: false,
            current: None,
            next: None,
            started_at: None,
            elapsed_sec: None,
            live,
        },
    }
}

/// Dispatches everything under `/studio/*`, splitting the captured tail into
/// `{id}/{action}` by hand since axum's router can't register a `{*rest}`
/// wildcard alongside a `{id}/{action}` pair at the same path segment.
pub async fn route_studio_request(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(rest): Path<String>,
    request: Request<Body>,
) -> Response {
    let mut segments = rest.split('/');
    let (studio_id, action) = match (segments.next(), segments.next(), segments.next()) {
        (Some(studio_id), Some(action), None) if !studio_id.is_empty() && !action.is_empty() => {
            (studio_id.to_string(), action.to_string())
        }
        _ => return malformed_studio_path().await,
    };

    let studio = match state.manager.get_studio(&studio_id) {
        Some(studio) => studio,
        None => return (StatusCode::NOT_FOUND, "studio not found").into_response(),
    };

    match action.as_str() {
        "live" => {
            let method = request.method().clone();
            if method != Method::PUT && method != Method::POST {
                return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
            }
            let (parts, body) = request.into_parts();
            handle_live_http(
                studio,
                state.manager.settings(),
                parts.method,
                parts.headers,
                peer,
                body,
            )
            .await
        }
        "listen" => {
            if request.method() != Method::GET {
                return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
            }
            handle_listen(
                studio,
                state.manager.store().clone(),
                state.manager.geo().clone(),
                request.headers(),
                peer,
            )
            .await
        }
        "status" => Json(studio.status()).into_response(),
        "snapshot" => {
            let (active, countries, _) = collect_sessions(state.manager.store(), &studio.id);
            Json(StudioSnapshot {
                studio_id: studio.id.clone(),
                active,
                countries,
            })
            .into_response()
        }
        "now" => Json(now_playing_response(&studio)).into_response(),
        "skip" => {
            if request.method() != Method::POST {
                return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
            }
            if studio.autodj().skip() {
                (StatusCode::OK, "skip requested").into_response()
            } else {
                (StatusCode::BAD_REQUEST, "autodj inactive").into_response()
            }
        }
        _ => (StatusCode::NOT_FOUND, "unknown action").into_response(),
    }
}

/// Anything under `/studio/` that is not `/{id}/{action}`.
pub async fn malformed_studio_path() -> Response {
    (StatusCode::BAD_REQUEST, "invalid studio endpoint").into_response()
}

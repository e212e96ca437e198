//! Icecast-compatible live ingest.
//!
//! Two entry points feed the same session logic: PUT/POST requests arrive
//! through the HTTP router with a streaming body, while `SOURCE` requests
//! are picked off the socket before HTTP parsing and answered with a raw
//! `HTTP/1.0 200 OK` the way legacy encoders expect.

use super::manager::StudioManager;
use super::studio::{Studio, StudioSettings, StudioShared};
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const ICECAST_SERVER: &str = "Icecast 2.4.0";

const READ_BUF_SIZE: usize = 8192;
const EARLY_EOF_GRACE: Duration = Duration::from_secs(5);
const PUT_POST_EXTRA_GRACE: Duration = Duration::from_secs(10);
const EARLY_EOF_SLEEP: Duration = Duration::from_millis(200);
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Metadata supplied by the encoder via `Ice-*` headers.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMeta {
    pub name: String,
    pub genre: String,
    pub description: String,
    pub url: String,
    pub bitrate: String,
    pub public: String,
    pub raw_headers: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("missing auth")]
    MissingAuth,
    #[error("invalid auth scheme")]
    InvalidScheme,
    #[error("bad base64")]
    BadBase64,
    #[error("invalid credential format")]
    BadCredentials,
    #[error("invalid user")]
    InvalidUser,
    #[error("invalid password")]
    InvalidPassword,
    #[error("source password not configured")]
    NotConfigured,
}

/// Validates an Icecast-style `Authorization: Basic` header against the
/// configured source credentials. Never logs the secrets it compares.
pub fn check_source_auth(auth: Option<&str>, settings: &StudioSettings) -> Result<(), IngestError> {
    let auth = auth.ok_or(IngestError::MissingAuth)?;
    let (scheme, encoded) = auth.split_once(' ').ok_or(IngestError::InvalidScheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(IngestError::InvalidScheme);
    }
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| IngestError::BadBase64)?;
    let decoded = String::from_utf8(decoded).map_err(|_| IngestError::BadBase64)?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or(IngestError::BadCredentials)?;

    let expected_pass = settings
        .source_password
        .as_deref()
        .ok_or(IngestError::NotConfigured)?;
    if user != settings.source_user {
        return Err(IngestError::InvalidUser);
    }
    if pass != expected_pass {
        return Err(IngestError::InvalidPassword);
    }
    Ok(())
}

/// Captures `Ice-*` metadata from any header list, keeping the raw values
/// verbatim under their original names.
pub fn extract_live_meta<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> LiveMeta {
    let mut meta = LiveMeta {
        name: String::new(),
        genre: String::new(),
        description: String::new(),
        url: String::new(),
        bitrate: String::new(),
        public: String::new(),
        raw_headers: HashMap::new(),
        updated_at: Utc::now(),
    };
    for (name, value) in headers {
        let lower = name.to_lowercase();
        match lower.as_str() {
            "ice-name" => meta.name = value.to_string(),
            "ice-genre" => meta.genre = value.to_string(),
            "ice-description" => meta.description = value.to_string(),
            "ice-url" => meta.url = value.to_string(),
            "ice-bitrate" => meta.bitrate = value.to_string(),
            "ice-public" => meta.public = value.to_string(),
            _ => {}
        }
        if lower.starts_with("ice-") {
            meta.raw_headers.insert(name.to_string(), value.to_string());
        }
    }
    meta
}

/// Releases the live slot (and its metadata) however the session ends.
struct LiveSession {
    shared: Arc<StudioShared>,
}

impl LiveSession {
    /// Claims the studio's live slot; `None` means another source is active.
    fn begin(studio: &Studio, meta: LiveMeta) -> Option<Self> {
        let shared = studio.shared().clone();
        if !shared.try_begin_live() {
            return None;
        }
        shared.set_live_meta(meta);
        Some(Self { shared })
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shared.end_live();
        info!("studio {}: live stream ended", self.shared.id);
    }
}

fn auth_failure_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            ("Server", ICECAST_SERVER),
            ("WWW-Authenticate", "Basic realm=\"source\""),
        ],
        "unauthorized",
    )
        .into_response()
}

/// PUT/POST ingest through the HTTP router. The body streams through hyper,
/// which answers any `Expect: 100-continue` once the body is polled.
pub async fn handle_live_http(
    studio: Arc<Studio>,
    settings: &StudioSettings,
    method: Method,
    headers: HeaderMap,
    peer: SocketAddr,
    body: Body,
) -> Response {
    info!(
        "studio {}: live ingest method={} remote={}",
        studio.id, method, peer
    );

    let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
    if let Err(err) = check_source_auth(auth, settings) {
        warn!("studio {}: live auth failed: {}", studio.id, err);
        return auth_failure_response();
    }

    let meta = extract_live_meta(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let session = match LiveSession::begin(&studio, meta.clone()) {
        Some(session) => session,
        None => {
            return (
                StatusCode::CONFLICT,
                [("Server", ICECAST_SERVER)],
                "live source already active",
            )
                .into_response();
        }
    };

    info!(
        "studio {}: live connected method={} name={:?} bitrate={}",
        studio.id, method, meta.name, meta.bitrate
    );

    let cancel = studio.cancel_token().clone();
    let grace_start = Instant::now();
    let max_grace = EARLY_EOF_GRACE + PUT_POST_EXTRA_GRACE;
    let mut bytes_received: u64 = 0;
    let mut stream = body.into_data_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if bytes_received == 0 {
                    info!(
                        "studio {}: first audio after {:?} (bytes={})",
                        studio.id,
                        grace_start.elapsed(),
                        chunk.len()
                    );
                }
                bytes_received += chunk.len() as u64;
                studio.push_to_feed(chunk);
            }
            Some(Err(err)) => {
                debug!("studio {}: live body error: {}", studio.id, err);
                break;
            }
            // A hyper body is terminal once it ends; an encoder that closed
            // inside the grace window cannot be re-read on this path.
            None => {
                if bytes_received == 0 && grace_start.elapsed() < max_grace {
                    warn!(
                        "studio {}: live body ended with no audio within grace ({:?})",
                        studio.id,
                        grace_start.elapsed()
                    );
                }
                break;
            }
        }
    }

    info!(
        "studio {}: live read end (total_bytes={})",
        studio.id, bytes_received
    );
    drop(session);

    (StatusCode::OK, [("Server", ICECAST_SERVER)], "").into_response()
}

/// Minimal parse of a raw `SOURCE` request head.
#[derive(Debug, PartialEq)]
pub(crate) struct SourceRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

pub(crate) fn parse_source_head(head: &str) -> Option<SourceRequest> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    if parts.next()? != "SOURCE" {
        return None;
    }
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some(SourceRequest { path, headers })
}

/// Splits `/studio/{id}/live` into the studio id.
fn parse_live_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/studio/")?;
    let (id, action) = rest.split_once('/')?;
    if action != "live" || id.is_empty() {
        return None;
    }
    Some(id)
}

async fn write_raw_response(stream: &mut TcpStream, status_line: &str, extra_headers: &[&str]) {
    let mut response = format!("HTTP/1.0 {}\r\nServer: {}\r\n", status_line, ICECAST_SERVER);
    for header in extra_headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Reads the request head off the raw socket, returning it together with
/// any body bytes that arrived in the same reads.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut collected: Vec<u8> = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_head_end(&collected) {
            let head = String::from_utf8_lossy(&collected[..pos]).into_owned();
            let leftover = collected[pos + 4..].to_vec();
            return Ok((head, leftover));
        }
        if collected.len() > MAX_HEAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Serves one hijacked `SOURCE` connection end to end.
pub(crate) async fn handle_source_socket(
    mut stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<StudioManager>,
) {
    let head = tokio::time::timeout(HEAD_READ_TIMEOUT, read_request_head(&mut stream)).await;
    let (head, leftover) = match head {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(err)) => {
            debug!("source: failed reading request head from {}: {}", peer, err);
            return;
        }
        Err(_) => {
            debug!("source: request head timeout from {}", peer);
            return;
        }
    };

    let request = match parse_source_head(&head) {
        Some(request) => request,
        None => {
            write_raw_response(&mut stream, "400 Bad Request", &[]).await;
            return;
        }
    };
    let studio_id = match parse_live_path(&request.path) {
        Some(id) => id.to_string(),
        None => {
            write_raw_response(&mut stream, "404 Not Found", &[]).await;
            return;
        }
    };
    let studio = match manager.get_studio(&studio_id) {
        Some(studio) => studio,
        None => {
            write_raw_response(&mut stream, "404 Not Found", &[]).await;
            return;
        }
    };

    info!(
        "studio {}: live ingest method=SOURCE remote={}",
        studio.id, peer
    );

    let auth = request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_str());
    if let Err(err) = check_source_auth(auth, manager.settings()) {
        warn!("studio {}: live auth failed: {}", studio.id, err);
        write_raw_response(
            &mut stream,
            "401 Unauthorized",
            &["WWW-Authenticate: Basic realm=\"source\""],
        )
        .await;
        return;
    }

    let meta = extract_live_meta(
        request
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );
    let session = match LiveSession::begin(&studio, meta.clone()) {
        Some(session) => session,
        None => {
            write_raw_response(&mut stream, "409 Conflict", &[]).await;
            return;
        }
    };

    // The minimal Icecast handshake: status line before any body read.
    write_raw_response(&mut stream, "200 OK", &[]).await;
    info!(
        "studio {}: live connected method=SOURCE name={:?} bitrate={}",
        studio.id, meta.name, meta.bitrate
    );

    let cancel = studio.cancel_token().clone();
    let grace_start = Instant::now();
    let mut early_eofs: u32 = 0;
    let mut bytes_received: u64 = 0;
    let mut buf = [0u8; READ_BUF_SIZE];

    if !leftover.is_empty() {
        bytes_received += leftover.len() as u64;
        studio.push_to_feed(Bytes::from(leftover));
    }

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if bytes_received == 0 && grace_start.elapsed() < EARLY_EOF_GRACE {
                    early_eofs += 1;
                    if early_eofs % 5 == 0 {
                        debug!(
                            "studio {}: waiting for first audio (eof_attempts={} elapsed={:?})",
                            studio.id,
                            early_eofs,
                            grace_start.elapsed()
                        );
                    }
                    tokio::time::sleep(EARLY_EOF_SLEEP).await;
                    continue;
                }
                if bytes_received == 0 {
                    warn!(
                        "studio {}: terminating, no audio within grace (attempts={})",
                        studio.id, early_eofs
                    );
                }
                break;
            }
            Ok(n) => {
                if bytes_received == 0 {
                    info!(
                        "studio {}: first audio after {:?} (bytes={})",
                        studio.id,
                        grace_start.elapsed(),
                        n
                    );
                }
                bytes_received += n as u64;
                // Copy out of the reusable read buffer before publishing.
                studio.push_to_feed(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(err) => {
                debug!("studio {}: live socket read error: {}", studio.id, err);
                break;
            }
        }
    }

    info!(
        "studio {}: live read end (total_bytes={})",
        studio.id, bytes_received
    );
    drop(session);
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings() -> StudioSettings {
        StudioSettings {
            bitrate_kbps: 128,
            source_user: "source".into(),
            source_password: Some("hackme".into()),
            backend_api: None,
            backend_api_key: None,
            flush_interval: Duration::from_secs(5),
            fallback_file: None::<PathBuf>,
        }
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn accepts_valid_credentials() {
        let header = basic("source", "hackme");
        assert!(check_source_auth(Some(&header), &settings()).is_ok());
    }

    #[test]
    fn auth_scheme_is_case_insensitive() {
        let header = basic("source", "hackme").replacen("Basic", "bAsIc", 1);
        assert!(check_source_auth(Some(&header), &settings()).is_ok());
    }

    #[test]
    fn rejects_bad_credentials() {
        let s = settings();
        assert_eq!(check_source_auth(None, &s), Err(IngestError::MissingAuth));
        assert_eq!(
            check_source_auth(Some("Bearer abc"), &s),
            Err(IngestError::InvalidScheme)
        );
        assert_eq!(
            check_source_auth(Some("Basic !!!"), &s),
            Err(IngestError::BadBase64)
        );
        let no_colon = format!("Basic {}", BASE64.encode("nocolon"));
        assert_eq!(
            check_source_auth(Some(&no_colon), &s),
            Err(IngestError::BadCredentials)
        );
        let wrong_user = basic("intruder", "hackme");
        assert_eq!(
            check_source_auth(Some(&wrong_user), &s),
            Err(IngestError::InvalidUser)
        );
        let wrong_pass = basic("source", "wrong");
        assert_eq!(
            check_source_auth(Some(&wrong_pass), &s),
            Err(IngestError::InvalidPassword)
        );
    }

    #[test]
    fn rejects_when_password_unconfigured() {
        let mut s = settings();
        s.source_password = None;
        let header = basic("source", "anything");
        assert_eq!(
            check_source_auth(Some(&header), &s),
            Err(IngestError::NotConfigured)
        );
    }

    #[test]
    fn extracts_ice_headers() {
        let headers = vec![
            ("Ice-Name", "Morning Show"),
            ("Ice-Genre", "Talk"),
            ("ICE-BITRATE", "128"),
            ("ice-custom", "x"),
            ("Content-Type", "audio/mpeg"),
        ];
        let meta = extract_live_meta(headers.into_iter());
        assert_eq!(meta.name, "Morning Show");
        assert_eq!(meta.genre, "Talk");
        assert_eq!(meta.bitrate, "128");
        assert_eq!(meta.raw_headers.len(), 4);
        assert_eq!(meta.raw_headers["ice-custom"], "x");
        assert!(!meta.raw_headers.contains_key("Content-Type"));
    }

    #[test]
    fn parses_source_request_head() {
        let head = "SOURCE /studio/main/live HTTP/1.0\r\nAuthorization: Basic abc\r\nIce-Name: X";
        let parsed = parse_source_head(head).unwrap();
        assert_eq!(parsed.path, "/studio/main/live");
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.headers[0], ("Authorization".into(), "Basic abc".into()));
    }

    #[test]
    fn rejects_non_source_head() {
        assert!(parse_source_head("GET / HTTP/1.1\r\n").is_none());
        assert!(parse_source_head("").is_none());
    }

    #[test]
    fn live_path_requires_live_action() {
        assert_eq!(parse_live_path("/studio/main/live"), Some("main"));
        assert!(parse_live_path("/studio/main/listen").is_none());
        assert!(parse_live_path("/studio//live").is_none());
        assert!(parse_live_path("/other/main/live").is_none());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"abc\r\n\r\nrest"), Some(3));
        assert!(find_head_end(b"abc\r\n").is_none());
    }
}

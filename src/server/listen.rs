//! Listener endpoint: attaches an HTTP client to a studio's broadcast.

use crate::listeners::{Listener, ListenerStore};
use crate::netutil::{classify_user_agent, extract_client_ip};
use crate::stream::Studio;
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::info;

/// Unregisters the listener however the response body ends: client
/// disconnect, slow-listener eviction or studio shutdown.
struct ListenerGuard {
    studio: Arc<Studio>,
    store: Arc<ListenerStore>,
    listener: Arc<Listener>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.listener.mark_disconnected();
        self.studio.unsubscribe(self.listener.id);
        self.store.remove(self.listener.id);
        info!(
            "studio {}: listener {} disconnected (bytes={})",
            self.studio.id,
            self.listener.id,
            self.listener.bytes_sent()
        );
    }
}

/// Response body: forwards chunks from the per-listener channel until it
/// closes, then drops the guard.
struct ListenerStream {
    rx: mpsc::Receiver<Bytes>,
    _guard: ListenerGuard,
}

impl Stream for ListenerStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

pub async fn handle_listen(
    studio: Arc<Studio>,
    store: Arc<ListenerStore>,
    geo: Arc<crate::geo::GeoResolver>,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Response {
    let remote_ip = extract_client_ip(headers, peer);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let client_type = classify_user_agent(&user_agent);

    let listener = Arc::new(Listener::new(
        studio.id.clone(),
        remote_ip,
        user_agent,
        client_type,
    ));

    store.add(listener.clone());
    let rx = studio.subscribe(listener.clone());

    // Geo lookup and IP hashing happen off the request path.
    {
        let listener = listener.clone();
        tokio::spawn(async move {
            geo.enrich(&listener);
        });
    }

    let stream = ListenerStream {
        rx,
        _guard: ListenerGuard {
            studio,
            store,
            listener,
        },
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

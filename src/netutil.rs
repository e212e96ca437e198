//! Client network helpers shared by the listen and ingest handlers.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Extracts the client IP, preferring the leftmost valid entry of
/// `X-Forwarded-For` over the peer address.
pub fn extract_client_ip(headers: &HeaderMap, peer: SocketAddr) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for part in xff.split(',') {
            if let Ok(ip) = part.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    Some(peer.ip())
}

/// Coarse player classification from the User-Agent string.
pub fn classify_user_agent(ua: &str) -> &'static str {
    let l = ua.to_lowercase();
    if l.contains("vlc") {
        "vlc"
    } else if l.contains("winamp") {
        "winamp"
    } else if l.contains("android") {
        "android_browser"
    } else if l.contains("iphone") || l.contains("ipad") {
        "ios_browser"
    } else if l.contains("mozilla") {
        "browser"
    } else {
        "other"
    }
}

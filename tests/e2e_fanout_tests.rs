//! End-to-end tests for the feed fan-out: ordered delivery to every
//! listener and slow-consumer eviction.

mod common;

use bytes::Bytes;
use common::{read_exact_bytes, TestClient, TestServer};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn fan_out_delivers_identical_ordered_bytes_to_all_listeners() {
    let server = TestServer::spawn(&["s"]).await;
    let client = TestClient::new(server.base_url.clone());
    let studio = server.manager.get_studio("s").unwrap();

    let mut listener_a = client.listen("s").await;
    let mut listener_b = client.listen("s").await;
    assert_eq!(listener_a.status(), 200);
    assert_eq!(listener_a.headers()["content-type"], "audio/mpeg");

    wait_until(|| studio.listener_count() == 2, "both listeners registered").await;

    studio.push_to_feed(Bytes::from_static(&[0x01, 0x02]));
    studio.push_to_feed(Bytes::from_static(&[0x03]));
    studio.push_to_feed(Bytes::from_static(&[0x04, 0x05, 0x06]));

    let expected = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
    assert_eq!(read_exact_bytes(&mut listener_a, 6).await, expected);
    assert_eq!(read_exact_bytes(&mut listener_b, 6).await, expected);
}

#[tokio::test]
async fn listener_disconnect_is_recorded_in_the_registry() {
    let server = TestServer::spawn(&["s"]).await;
    let client = TestClient::new(server.base_url.clone());
    let studio = server.manager.get_studio("s").unwrap();

    let listener = client.listen("s").await;
    wait_until(|| studio.listener_count() == 1, "listener registered").await;
    assert_eq!(server.store().active_for_studio("s").len(), 1);

    drop(listener);
    wait_until(
        || server.store().active_for_studio("s").is_empty(),
        "listener unregistered",
    )
    .await;
    wait_until(|| studio.listener_count() == 0, "channel slot removed").await;
}

#[tokio::test]
async fn slow_listener_is_evicted_without_disturbing_the_rest() {
    let server = TestServer::spawn(&["s"]).await;
    let client = TestClient::new(server.base_url.clone());
    let studio = server.manager.get_studio("s").unwrap();

    // A listener that never reads its socket.
    let mut stuck = TcpStream::connect(("127.0.0.1", server.port))
        .await
        .expect("connect failed");
    stuck
        .write_all(b"GET /studio/s/listen HTTP/1.1\r\nHost: test\r\nUser-Agent: stuck\r\n\r\n")
        .await
        .expect("request write failed");

    let mut healthy = client.listen("s").await;
    wait_until(|| studio.listener_count() == 2, "both listeners registered").await;

    // Drain the healthy listener in the background so only the stuck one
    // backs up.
    let healthy_bytes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = healthy_bytes.clone();
    let drain = tokio::spawn(async move {
        while let Ok(Some(chunk)) = healthy.chunk().await {
            counter.fetch_add(chunk.len(), std::sync::atomic::Ordering::SeqCst);
        }
    });

    // Push enough to jam the stuck listener's socket, fill its channel and
    // cross the consecutive-drop threshold.
    let chunk = Bytes::from(vec![0u8; 8192]);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while studio.listener_count() > 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "slow listener was never evicted"
        );
        for _ in 0..64 {
            studio.push_to_feed(chunk.clone());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Only the healthy listener remains, and it kept receiving.
    assert_eq!(studio.listener_count(), 1);
    let before = healthy_bytes.load(std::sync::atomic::Ordering::SeqCst);
    studio.push_to_feed(Bytes::from_static(&[0xEE; 16]));
    wait_until(
        || healthy_bytes.load(std::sync::atomic::Ordering::SeqCst) > before,
        "survivor kept receiving",
    )
    .await;

    drain.abort();
}

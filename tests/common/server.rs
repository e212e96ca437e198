//! Test server lifecycle management.
//!
//! Each test gets an isolated server on a random port with its own
//! temporary audio directories; the full accept loop runs, so both the
//! HTTP surface and the raw `SOURCE` ingest path are exercised.

use super::constants::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studiocast_server::geo::GeoResolver;
use studiocast_server::listeners::ListenerStore;
use studiocast_server::server::{serve, RequestsLoggingLevel, ServerConfig, ServerState};
use studiocast_server::stream::{StudioManager, StudioSettings};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// One studio with its pre-seeded audio files (name, content).
pub struct StudioAudio {
    pub id: String,
    pub tracks: Vec<(String, Vec<u8>)>,
}

impl StudioAudio {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(id: &str, tracks: &[(&str, usize)]) -> Self {
        Self {
            id: id.to_string(),
            tracks: tracks
                .iter()
                .map(|(name, len)| (name.to_string(), track_bytes(*len)))
                .collect(),
        }
    }
}

pub struct TestServerOptions {
    pub studios: Vec<StudioAudio>,
    pub bitrate_kbps: i64,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            studios: Vec::new(),
            // High enough that pacing sleeps never slow a test down.
            bitrate_kbps: 100_000,
        }
    }
}

/// Deterministic pseudo-audio content of a given length.
pub fn track_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub struct TestServer {
    pub base_url: String,
    pub port: u16,
    pub manager: Arc<StudioManager>,

    _audio_dir: TempDir,
    cancel: CancellationToken,
}

impl TestServer {
    /// Spawns a server with the given studios, all with empty audio dirs.
    pub async fn spawn(studios: &[&str]) -> Self {
        let options = TestServerOptions {
            studios: studios.iter().map(|id| StudioAudio::empty(id)).collect(),
            ..TestServerOptions::default()
        };
        Self::spawn_with(options).await
    }

    pub async fn spawn_with(options: TestServerOptions) -> Self {
        let audio_dir = TempDir::new().expect("failed to create audio dir");

        // Seed audio files before studios start, so the first playlist scan
        // already sees them.
        for studio in &options.studios {
            let dir = audio_dir.path().join(&studio.id);
            fs::create_dir_all(&dir).expect("failed to create studio dir");
            for (name, content) in &studio.tracks {
                fs::write(dir.join(name), content).expect("failed to write track");
            }
        }

        let settings = StudioSettings {
            bitrate_kbps: options.bitrate_kbps,
            source_user: TEST_SOURCE_USER.to_string(),
            source_password: Some(TEST_SOURCE_PASS.to_string()),
            backend_api: None,
            backend_api_key: None,
            flush_interval: Duration::from_secs(5),
            fallback_file: None,
        };

        let store = Arc::new(ListenerStore::new());
        let geo = Arc::new(GeoResolver::new(None, TEST_IP_SALT, false));
        let manager = StudioManager::new(
            audio_dir.path().to_path_buf(),
            settings,
            store,
            geo,
        );
        for studio in &options.studios {
            manager.register_studio(&studio.id);
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let cancel = CancellationToken::new();
        let state = ServerState::new(
            ServerConfig {
                requests_logging_level: RequestsLoggingLevel::None,
            },
            manager.clone(),
        );
        {
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                serve(listener, state, cancel).await.expect("server failed");
            });
        }

        let server = Self {
            base_url,
            port,
            manager,
            _audio_dir: audio_dir,
            cancel,
        };
        server.wait_for_ready().await;
        server
    }

    pub fn store(&self) -> &Arc<ListenerStore> {
        self.manager.store()
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!("server did not become ready within {}ms", SERVER_READY_TIMEOUT_MS);
            }
            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

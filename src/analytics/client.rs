//! HTTP client for the external analytics backend.

use super::{IngestListenerBatch, PlayEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts JSON payloads to the configured ingest URL with bearer auth.
///
/// A client constructed without a URL swallows every send; that keeps the
/// call sites unconditional in the AutoDJ and flush loops.
#[derive(Clone)]
pub struct AnalyticsClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: Option<String>,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl AnalyticsClient {
    pub fn new(url: Option<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(ClientInner {
                url: url.filter(|u| !u.is_empty()),
                api_key: api_key.filter(|k| !k.is_empty()),
                http,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.url.is_some()
    }

    async fn send_json<T: Serialize>(&self, payload: &T) -> Result<()> {
        let url = match &self.inner.url {
            Some(url) => url,
            None => return Ok(()),
        };

        let mut request = self
            .inner
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(key) = &self.inner.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("failed to reach analytics backend")?;
        if !response.status().is_success() {
            anyhow::bail!("ingest failed: status={}", response.status().as_u16());
        }
        Ok(())
    }

    pub async fn send_listener_batch(&self, batch: &IngestListenerBatch) -> Result<()> {
        self.send_json(batch).await
    }

    pub async fn send_play_events(&self, events: &[PlayEvent]) -> Result<()> {
        self.send_json(&events).await
    }

    /// Fire-and-forget variant for track boundaries; failures are logged and
    /// never block playback.
    pub fn send_play_events_detached(&self, events: Vec<PlayEvent>) {
        if !self.is_enabled() {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.send_play_events(&events).await {
                warn!("analytics: play event delivery failed: {:#}", err);
            }
        });
    }
}

//! HTTP client helpers for the e2e tests.

use super::constants::*;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Response;
use serde_json::Value;
use std::time::Duration;

pub struct TestClient {
    pub client: reqwest::Client,
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self { client, base_url }
    }

    pub fn basic_auth_header(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
    }

    pub fn valid_source_auth() -> String {
        Self::basic_auth_header(TEST_SOURCE_USER, TEST_SOURCE_PASS)
    }

    pub async fn status(&self, studio: &str) -> Value {
        self.get_json(&format!("/studio/{}/status", studio)).await
    }

    pub async fn now(&self, studio: &str) -> Value {
        self.get_json(&format!("/studio/{}/now", studio)).await
    }

    pub async fn snapshot(&self, studio: &str) -> Value {
        self.get_json(&format!("/studio/{}/snapshot", studio)).await
    }

    pub async fn skip(&self, studio: &str) -> Response {
        self.client
            .post(format!("{}/studio/{}/skip", self.base_url, studio))
            .send()
            .await
            .expect("skip request failed")
    }

    /// Starts a streaming listener request; the response body is left open.
    pub async fn listen(&self, studio: &str) -> Response {
        self.client
            .get(format!("{}/studio/{}/listen", self.base_url, studio))
            .send()
            .await
            .expect("listen request failed")
    }

    /// PUT live ingest with an optional Authorization header and a fixed body.
    pub async fn live_put(&self, studio: &str, auth: Option<&str>, body: Vec<u8>) -> Response {
        let mut request = self
            .client
            .put(format!("{}/studio/{}/live", self.base_url, studio))
            .body(body);
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        request.send().await.expect("live request failed")
    }

    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("request failed")
    }

    async fn get_json(&self, path: &str) -> Value {
        let response = self.get(path).await;
        assert!(
            response.status().is_success(),
            "GET {} returned {}",
            path,
            response.status()
        );
        response.json().await.expect("response was not JSON")
    }
}

/// Reads the streaming response until `n` bytes have arrived.
pub async fn read_exact_bytes(response: &mut Response, n: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(n);
    while collected.len() < n {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("timed out reading stream")
            .expect("stream errored")
            .expect("stream closed early");
        collected.extend_from_slice(&chunk);
    }
    collected.truncate(n);
    collected
}

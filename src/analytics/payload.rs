//! Wire types shipped to the analytics backend.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ip_hash: String,
    pub user_agent: String,
    pub client_type: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerBucket {
    pub interval: String,
    pub bucket_start: DateTime<Utc>,
    pub active_peak: usize,
    pub listener_minutes: u64,
    pub countries: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestListenerBatch {
    pub studio_id: String,
    pub sessions: Vec<ListenerSession>,
    pub buckets: Vec<ListenerBucket>,
}

/// A track lifecycle event. `started_at`/`ended_at` are mutually exclusive
/// depending on `event_type`.
#[derive(Debug, Clone, Serialize)]
pub struct PlayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub track_id: String,
    pub file: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PlayEvent {
    pub fn track_started(track_id: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            event_type: "track_started".into(),
            track_id: track_id.into(),
            file: file.into(),
            source: "AUTO".into(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    pub fn track_ended(track_id: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            event_type: "track_ended".into(),
            track_id: track_id.into(),
            file: file.into(),
            source: "AUTO".into(),
            started_at: None,
            ended_at: Some(Utc::now()),
        }
    }
}

/// Per-studio view served by the snapshot endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StudioSnapshot {
    pub studio_id: String,
    pub active: usize,
    pub countries: HashMap<String, usize>,
}

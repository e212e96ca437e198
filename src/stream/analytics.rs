//! Per-studio listener analytics: rolling buckets and the periodic flush.

use super::studio::StudioShared;
use crate::analytics::{AnalyticsClient, IngestListenerBatch, ListenerBucket, ListenerSession};
use crate::listeners::ListenerStore;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketInterval {
    Minute,
    FiveMinutes,
    Hour,
}

impl BucketInterval {
    pub const ALL: [BucketInterval; 3] = [
        BucketInterval::Minute,
        BucketInterval::FiveMinutes,
        BucketInterval::Hour,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BucketInterval::Minute => "MINUTE",
            BucketInterval::FiveMinutes => "FIVE_MIN",
            BucketInterval::Hour => "HOUR",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            BucketInterval::Minute => 60,
            BucketInterval::FiveMinutes => 300,
            BucketInterval::Hour => 3_600,
        }
    }

    /// UTC bucket start for `t`: the timestamp truncated to this width.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let start = secs - secs.rem_euclid(self.seconds());
        Utc.timestamp_opt(start, 0).single().unwrap_or(t)
    }
}

#[derive(Debug, Default, Clone)]
struct BucketAgg {
    active_peak: usize,
    listener_minutes: u64,
    countries: HashMap<String, usize>,
}

/// Rolling aggregation windows, keyed by interval kind and bucket start.
/// Touched once per flush tick, so a plain mutex is plenty.
#[derive(Default)]
pub struct BucketState {
    buckets: Mutex<HashMap<(BucketInterval, DateTime<Utc>), BucketAgg>>,
}

impl BucketState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one registry sample into the bucket of every interval kind.
    pub fn add_sample(
        &self,
        now: DateTime<Utc>,
        active: usize,
        countries: &HashMap<String, usize>,
    ) {
        let mut buckets = self.buckets.lock().unwrap();
        for interval in BucketInterval::ALL {
            let start = interval.truncate(now);
            let agg = buckets.entry((interval, start)).or_default();
            agg.active_peak = agg.active_peak.max(active);
            for (country, count) in countries {
                *agg.countries.entry(country.clone()).or_default() += count;
            }
        }
    }

    /// Accrues listener-minutes for the sampling gap into every open bucket.
    pub fn accrue_listener_minutes(&self, delta: chrono::Duration, active: usize) {
        if active == 0 || delta <= chrono::Duration::zero() {
            return;
        }
        let minutes = ((delta.num_milliseconds() as f64 / 60_000.0) + 0.5).floor() as u64;
        if minutes == 0 {
            return;
        }
        let mut buckets = self.buckets.lock().unwrap();
        for agg in buckets.values_mut() {
            agg.listener_minutes += minutes * active as u64;
        }
    }

    /// Removes and returns every bucket whose window ends at or before
    /// `cutoff`.
    pub fn drain_ready(&self, cutoff: DateTime<Utc>) -> Vec<ListenerBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        let ready: Vec<(BucketInterval, DateTime<Utc>)> = buckets
            .keys()
            .filter(|(interval, start)| {
                *start + chrono::Duration::seconds(interval.seconds()) <= cutoff
            })
            .cloned()
            .collect();
        ready
            .into_iter()
            .filter_map(|key| {
                buckets.remove(&key).map(|agg| ListenerBucket {
                    interval: key.0.label().to_string(),
                    bucket_start: key.1,
                    active_peak: agg.active_peak,
                    listener_minutes: agg.listener_minutes,
                    countries: agg.countries,
                })
            })
            .collect()
    }
}

/// Snapshot of a studio's registry: active count, per-country counts and a
/// session DTO per listener.
pub fn collect_sessions(
    store: &ListenerStore,
    studio_id: &str,
) -> (usize, HashMap<String, usize>, Vec<ListenerSession>) {
    let mut active = 0;
    let mut countries: HashMap<String, usize> = HashMap::new();
    let mut sessions = Vec::new();

    for listener in store.for_studio(studio_id) {
        if listener.is_connected() {
            active += 1;
        }
        let geo = listener.geo();
        if !geo.country.is_empty() {
            *countries.entry(geo.country.clone()).or_default() += 1;
        }
        sessions.push(ListenerSession {
            id: listener.id.to_string(),
            started_at: listener.connected_at,
            ended_at: listener.disconnected_at(),
            ip_hash: geo.ip_hash,
            user_agent: listener.user_agent.clone(),
            client_type: listener.client_type.to_string(),
            country: geo.country,
            region: geo.region,
            city: geo.city,
            lat: geo.lat,
            lon: geo.lon,
            total_bytes: listener.bytes_sent(),
        });
    }
    (active, countries, sessions)
}

/// Spawns the per-studio flush loop: sample the registry, roll the buckets,
/// ship whatever windows have closed.
pub(crate) fn spawn_analytics(
    shared: Arc<StudioShared>,
    store: Arc<ListenerStore>,
    client: AnalyticsClient,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let buckets = BucketState::new();
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last = Utc::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let (active, countries, sessions) = collect_sessions(&store, &shared.id);
            buckets.add_sample(now, active, &countries);
            buckets.accrue_listener_minutes(now - last, active);
            last = now;

            let batch = IngestListenerBatch {
                studio_id: shared.id.clone(),
                sessions,
                buckets: buckets.drain_ready(now - chrono::Duration::seconds(1)),
            };
            if let Err(err) = client.send_listener_batch(&batch).await {
                warn!("studio {}: analytics flush failed: {:#}", shared.id, err);
            } else {
                debug!(
                    "studio {}: flushed {} sessions, {} buckets",
                    shared.id,
                    batch.sessions.len(),
                    batch.buckets.len()
                );
            }
        }
        debug!("studio {}: analytics stopped", shared.id);
    })
}

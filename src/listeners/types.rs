use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Geo and privacy fields filled in by the enrichment task.
///
/// The raw IP lives here only until enrichment completes; after that the
/// salted hash is the sole identifier.
#[derive(Debug, Clone, Default)]
pub struct GeoInfo {
    pub remote_ip: Option<IpAddr>,
    pub ip_hash: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

/// A connected (or recently disconnected) listener session.
///
/// Shared between the owning HTTP handler, the distributor (byte counters)
/// and the analytics sampler, so the mutable pieces are atomics or live
/// behind the geo mutex.
pub struct Listener {
    pub id: Uuid,
    pub studio_id: String,
    pub connected_at: DateTime<Utc>,
    pub user_agent: String,
    pub client_type: &'static str,

    geo: Mutex<GeoInfo>,

    bytes_sent: AtomicU64,
    // Epoch millis; 0 means unset.
    disconnected_at_ms: AtomicI64,
    last_heartbeat_ms: AtomicI64,
    enriched: AtomicBool,
}

impl Listener {
    pub fn new(
        studio_id: String,
        remote_ip: Option<IpAddr>,
        user_agent: String,
        client_type: &'static str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            studio_id,
            connected_at: Utc::now(),
            user_agent,
            client_type,
            geo: Mutex::new(GeoInfo {
                remote_ip,
                ..GeoInfo::default()
            }),
            bytes_sent: AtomicU64::new(0),
            disconnected_at_ms: AtomicI64::new(0),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            enriched: AtomicBool::new(false),
        }
    }

    /// Records the disconnect timestamp. Only the first call wins; returns
    /// whether this call was the one that set it.
    pub fn mark_disconnected(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        self.disconnected_at_ms
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        match self.disconnected_at_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at_ms.load(Ordering::Acquire) == 0
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Refreshes the heartbeat if it is older than `stale_ms`.
    pub fn touch_heartbeat(&self, stale_ms: i64) {
        let now = Utc::now().timestamp_millis();
        let last = self.last_heartbeat_ms.load(Ordering::Relaxed);
        if now - last > stale_ms {
            self.last_heartbeat_ms.store(now, Ordering::Relaxed);
        }
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_heartbeat_ms.load(Ordering::Relaxed))
            .single()
    }

    pub fn set_enriched(&self) {
        self.enriched.store(true, Ordering::Release);
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched.load(Ordering::Acquire)
    }

    pub fn geo(&self) -> GeoInfo {
        self.geo.lock().unwrap().clone()
    }

    /// Runs `f` against the geo fields under the lock.
    pub fn with_geo_mut<R>(&self, f: impl FnOnce(&mut GeoInfo) -> R) -> R {
        f(&mut self.geo.lock().unwrap())
    }
}

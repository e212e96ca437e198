//! GeoIP enrichment and IP privacy.
//!
//! Every listener goes through `enrich` exactly once: geo fields are filled
//! in when a database is available, and in all cases the raw IP is replaced
//! by a salted SHA-256 digest.

use crate::listeners::Listener;
use maxminddb::geoip2;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

pub struct GeoResolver {
    db: Option<maxminddb::Reader<Vec<u8>>>,
    salt: Vec<u8>,
}

impl GeoResolver {
    /// Opens the MaxMind database at `db_path` when `enabled`. A missing or
    /// unreadable database degrades to hash-only enrichment.
    pub fn new(db_path: Option<&Path>, salt: &str, enabled: bool) -> Self {
        let db = match (enabled, db_path) {
            (true, Some(path)) => match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    warn!("geoip: failed opening {:?}: {} (continuing without geo)", path, err);
                    None
                }
            },
            (true, None) => {
                warn!("geoip: enabled but no database path configured");
                None
            }
            _ => None,
        };
        Self {
            db,
            salt: salt.as_bytes().to_vec(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Fills in geo fields where possible, then hashes and erases the raw IP.
    pub fn enrich(&self, listener: &Listener) {
        let ip = match listener.geo().remote_ip {
            Some(ip) => ip,
            None => return,
        };

        if let Some(db) = &self.db {
            if let Ok(city) = db.lookup::<geoip2::City>(ip) {
                listener.with_geo_mut(|geo| {
                    if let Some(code) = city.country.as_ref().and_then(|c| c.iso_code) {
                        geo.country = code.to_string();
                    }
                    if let Some(region) = city
                        .subdivisions
                        .as_ref()
                        .and_then(|s| s.first())
                        .and_then(|s| s.names.as_ref())
                        .and_then(|n| n.get("en"))
                    {
                        geo.region = region.to_string();
                    }
                    if let Some(name) = city
                        .city
                        .as_ref()
                        .and_then(|c| c.names.as_ref())
                        .and_then(|n| n.get("en"))
                    {
                        geo.city = name.to_string();
                    }
                    if let Some(location) = city.location.as_ref() {
                        geo.lat = location.latitude.map(round2).unwrap_or(0.0);
                        geo.lon = location.longitude.map(round2).unwrap_or(0.0);
                    }
                });
            }
        }

        self.hash_and_erase(listener, ip);
        listener.set_enriched();
    }

    fn hash_and_erase(&self, listener: &Listener, ip: IpAddr) {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(ip.to_string().as_bytes());
        let digest = hasher.finalize();
        listener.with_geo_mut(|geo| {
            geo.ip_hash = hex::encode(digest);
            geo.remote_ip = None;
        });
    }
}

// Biased truncation, not round-half-away: -0.127758 maps to -0.12.
fn round2(f: f64) -> f64 {
    ((f * 100.0 + 0.5) as i64) as f64 / 100.0
}

//! Process configuration.
//!
//! Every knob is an environment variable with a CLI flag override; clap
//! resolves the precedence (flag wins over env wins over default).

use crate::server::RequestsLoggingLevel;
use crate::stream::StudioSettings;
use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Icecast-compatible multi-tenant live broadcast server")]
pub struct CliArgs {
    /// Address to bind the HTTP/ingest listener on.
    #[clap(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Base directory holding one audio folder per studio.
    #[clap(long, env = "AUDIO_DIR", default_value = "./audio")]
    pub audio_dir: PathBuf,

    /// Studio ids to register at startup.
    #[clap(long, env = "STUDIOS", value_delimiter = ',')]
    pub studios: Vec<String>,

    /// Path to a MaxMind GeoIP2/GeoLite2 City database.
    #[clap(long, env = "GEOIP_DB_PATH")]
    pub geoip_db_path: Option<PathBuf>,

    /// Salt prepended to listener IPs before hashing.
    #[clap(long, env = "IP_HASH_SALT", default_value = "")]
    pub ip_hash_salt: String,

    /// Enable GeoIP lookups (0 or 1).
    #[clap(long, env = "ENABLE_GEOIP", default_value = "0")]
    pub enable_geoip: String,

    /// AutoDJ pacing bitrate for studios, in kbit/s.
    #[clap(long, env = "DEFAULT_BITRATE_KBPS", default_value_t = 128)]
    pub default_bitrate_kbps: i64,

    /// Seconds between studio-monitor log lines.
    #[clap(long, env = "SNAPSHOT_INTERVAL", default_value_t = 5)]
    pub snapshot_interval: u64,

    /// Base URL of the analytics/playlist backend.
    #[clap(long, env = "BACKEND_API")]
    pub backend_api: Option<String>,

    /// Bearer token for the backend.
    #[clap(long, env = "BACKEND_API_KEY")]
    pub backend_api_key: Option<String>,

    /// Seconds between analytics flushes.
    #[clap(long, env = "EVENT_FLUSH_INTERVAL", default_value_t = 5)]
    pub event_flush_interval: u64,

    /// Absolute path of a fallback track for empty playlists.
    #[clap(long, env = "DEFAULT_TRACK_FILE")]
    pub default_track_file: Option<PathBuf>,

    /// Username live encoders must authenticate as.
    #[clap(long, env = "SOURCE_USER", default_value = "source")]
    pub source_user: String,

    /// Password for live encoders; live ingest is rejected until set.
    #[clap(long, env = "SOURCE_PASSWORD")]
    pub source_password: Option<String>,

    /// The level of logging to perform on each request.
    #[clap(long, env = "REQUESTS_LOGGING", default_value = "path")]
    pub logging_level: RequestsLoggingLevel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub audio_dir: PathBuf,
    pub studios: Vec<String>,
    pub geoip_db_path: Option<PathBuf>,
    pub ip_hash_salt: String,
    pub enable_geoip: bool,
    pub snapshot_interval: Duration,
    pub logging_level: RequestsLoggingLevel,
    pub studio_settings: StudioSettings,
}

impl AppConfig {
    pub fn resolve(args: CliArgs) -> Result<Self> {
        let enable_geoip = match args.enable_geoip.as_str() {
            "0" | "" => false,
            "1" => true,
            other => bail!("ENABLE_GEOIP must be 0 or 1, got {:?}", other),
        };

        if args.event_flush_interval == 0 {
            bail!("EVENT_FLUSH_INTERVAL must be positive");
        }
        if args.snapshot_interval == 0 {
            bail!("SNAPSHOT_INTERVAL must be positive");
        }

        let backend_api = args
            .backend_api
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let studios: Vec<String> = args
            .studios
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        Ok(Self {
            listen_addr: args.listen_addr,
            audio_dir: args.audio_dir,
            studios,
            geoip_db_path: args.geoip_db_path,
            ip_hash_salt: args.ip_hash_salt,
            enable_geoip,
            snapshot_interval: Duration::from_secs(args.snapshot_interval),
            logging_level: args.logging_level,
            studio_settings: StudioSettings {
                bitrate_kbps: args.default_bitrate_kbps,
                source_user: args.source_user,
                source_password: args.source_password.filter(|p| !p.is_empty()),
                backend_api,
                backend_api_key: args.backend_api_key.filter(|k| !k.is_empty()),
                flush_interval: Duration::from_secs(args.event_flush_interval),
                fallback_file: args.default_track_file,
            },
        })
    }
}

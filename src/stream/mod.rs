//! The studio broadcast engine: playlist, AutoDJ, feed fan-out, live
//! ingest and per-studio analytics.

mod analytics;
mod autodj;
mod live;
mod manager;
mod playlist;
mod studio;

pub use analytics::{collect_sessions, BucketInterval, BucketState};
pub use autodj::{AutoDjHandle, DjCommand, NowPlaying, TrackError};
pub use live::{check_source_auth, extract_live_meta, IngestError, LiveMeta, ICECAST_SERVER};
pub use manager::StudioManager;
pub use playlist::{scan_mp3_files, PlaylistSource, Track};
pub use studio::{Studio, StudioSettings, StudioStatus};

pub(crate) use live::{handle_live_http, handle_source_socket};

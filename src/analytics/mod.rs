mod client;
mod payload;

pub use client::AnalyticsClient;
pub use payload::{
    IngestListenerBatch, ListenerBucket, ListenerSession, PlayEvent, StudioSnapshot,
};

//! Studiocast: an Icecast-compatible multi-tenant live broadcast server.
//!
//! Exposes the internal modules for the e2e test suite and embedding.

pub mod analytics;
pub mod config;
pub mod geo;
pub mod listeners;
pub mod netutil;
pub mod server;
pub mod stream;

pub use server::{make_app, run_server, serve, RequestsLoggingLevel, ServerConfig, ServerState};
pub use stream::{Studio, StudioManager, StudioSettings};

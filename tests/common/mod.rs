//! Shared infrastructure for the end-to-end tests.

mod client;
mod constants;
mod server;

#[allow(unused_imports)]
pub use client::{read_exact_bytes, TestClient};
#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use server::{track_bytes, StudioAudio, TestServer, TestServerOptions};

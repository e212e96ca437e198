//! Shared constants for the e2e suite.

pub const TEST_SOURCE_USER: &str = "source";
pub const TEST_SOURCE_PASS: &str = "s3cret-test-pass";
pub const TEST_IP_SALT: &str = "test-salt";

pub const SERVER_READY_TIMEOUT_MS: u64 = 5_000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

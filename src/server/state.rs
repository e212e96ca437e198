use crate::stream::StudioManager;
use std::sync::Arc;
use std::time::Instant;

use super::RequestsLoggingLevel;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub manager: Arc<StudioManager>,
}

impl ServerState {
    pub fn new(config: ServerConfig, manager: Arc<StudioManager>) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            manager,
        }
    }
}

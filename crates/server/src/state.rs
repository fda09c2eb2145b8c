use std::sync::Arc;
use std::time::Instant;

use crate::categorizer::Categorizer;
use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub categorizer: Arc<Categorizer>,
    pub config: Arc<ServerConfig>,
    started_at: Instant,
}

impl AppState {
    pub fn new(categorizer: Categorizer, config: ServerConfig) -> Self {
        Self {
            categorizer: Arc::new(categorizer),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

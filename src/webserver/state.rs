/// Shared application state for the webserver
use std::sync::Arc;

use crate::broker::BrokerHandle;
use crate::config::WebserverConfig;

/// Shared application state passed to all route handlers
#[derive(Clone)]
pub struct AppState {
    /// Producer side of the dispatch loop
    pub broker: BrokerHandle,

    /// Webserver configuration
    pub config: Arc<WebserverConfig>,

    /// Frames each socket task may buffer before the broker queues instead
    pub transport_buffer: usize,

    /// Server startup time
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(broker: BrokerHandle, config: WebserverConfig, transport_buffer: usize) -> Self {
        Self {
            broker,
            config: Arc::new(config),
            transport_buffer: transport_buffer.max(1),
            startup_time: chrono::Utc::now(),
        }
    }

    /// Seconds since the server started
    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.startup_time).num_seconds()
    }
}

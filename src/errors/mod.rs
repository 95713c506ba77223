/// Error handling for the state broker
///
/// Every per-message failure is local and non-fatal: the broker degrades to a
/// missed update instead of failing the connection or the process. Callers on
/// the hot path inspect the variant, bump a counter and move on.
use thiserror::Error;

use crate::broker::hub::ConnectionId;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Topic already registered: {topic}")]
    DuplicateTopic { topic: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Queue full: {queue} (capacity {capacity})")]
    QueueFull { queue: &'static str, capacity: usize },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Transport not ready for connection {0}")]
    TransportNotReady(ConnectionId),

    #[error("Connection gone: {0}")]
    ConnectionGone(ConnectionId),

    #[error("Publish throttled for topic {topic}")]
    Throttled { topic: String },

    #[error("Broker stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Failures that only cost a single update and never the connection
    pub fn is_dropped_message(&self) -> bool {
        matches!(
            self,
            BrokerError::TopicNotFound { .. }
                | BrokerError::QueueFull { .. }
                | BrokerError::MalformedPayload(_)
                | BrokerError::ConnectionGone(_)
                | BrokerError::Throttled { .. }
        )
    }

    /// Short machine-readable code, used in log lines and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::DuplicateTopic { .. } => "duplicate_topic",
            BrokerError::TopicNotFound { .. } => "topic_not_found",
            BrokerError::QueueFull { .. } => "queue_full",
            BrokerError::MalformedPayload(_) => "malformed_payload",
            BrokerError::TransportNotReady(_) => "transport_not_ready",
            BrokerError::ConnectionGone(_) => "connection_gone",
            BrokerError::Throttled { .. } => "throttled",
            BrokerError::Stopped => "stopped",
            BrokerError::Config(_) => "config",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Io(_) => "io",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

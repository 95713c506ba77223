/// State synchronization broker
///
/// Multiplexes named topics of application state over many client
/// connections. Clients subscribe to one topic each, receive its full state
/// on connect and after every change, and may push partial updates back.
///
/// Architecture:
/// - `topics`: identifier -> state binding registry
/// - `queue`: bounded outbound/inbound queues between producers and the loop
/// - `send_queue`: per-connection backpressure queue
/// - `health`: liveness probes, eviction and RTT estimation
/// - `hub`: the dispatch loop and the `BrokerHandle` producers use
/// - `throttle`: optional per-topic publish rate limit
/// - `metrics`: hub and per-connection counters
pub mod health;
pub mod hub;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod send_queue;
pub mod throttle;
pub mod topics;

pub use hub::{Broker, BrokerHandle, ConnectionId, ConnectionSnapshot, HubEvent};
pub use message::{Frame, FrameMode, InboundMessage, OutboundMessage, WsEnvelope};
pub use metrics::{ConnectionStats, HubMetrics, HubMetricsSnapshot};
pub use send_queue::{ConnectionSender, Outgoing};
pub use topics::{
    shared, update_field, SharedState, StateBody, StateUpdateResult, TopicBinding,
    TopicRegistry, TopicState,
};

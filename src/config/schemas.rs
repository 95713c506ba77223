/// Configuration schemas - all config structures defined once with defaults
///
/// Each struct is defined using the config_struct! macro which provides:
/// - Single-source definition (no repetition)
/// - Embedded defaults
/// - Serde support
use std::time::Duration;

use crate::config_struct;

// ============================================================================
// BROKER CONFIGURATION
// ============================================================================

config_struct! {
    /// Broker queue sizing, liveness timing and publish throttling
    ///
    /// Every buffer the broker allocates is sized from here; nothing grows
    /// past these bounds at runtime.
    pub struct BrokerConfig {
        /// Interval between liveness probes sent to every connection
        ping_interval_secs: u64 = 10,

        /// A connection whose last pong is older than this is evicted
        pong_timeout_secs: u64 = 30,

        /// Slots in the shared outbound (publish) queue
        outbound_queue_capacity: usize = 10,

        /// Slots in the shared inbound (client update) queue
        inbound_queue_capacity: usize = 10,

        /// Slots in each connection's backpressure queue
        send_queue_capacity: usize = 20,

        /// Frames a connection's socket task may hold before the transport
        /// counts as not ready
        transport_buffer: usize = 4,

        /// Slots for connection lifecycle events (connect/disconnect/pong)
        event_queue_capacity: usize = 64,

        /// EWMA smoothing factor for round-trip time samples
        rtt_alpha: f64 = 0.3,

        /// Dispatch loop wakes at least this often to run housekeeping
        idle_wakeup_ms: u64 = 100,

        /// Max messages taken from one queue before servicing the others
        drain_batch: usize = 32,

        /// Minimum gap between publishes of one topic (0 = unlimited)
        publish_min_interval_ms: u64 = 0,

        /// Max publishes of one topic per second (0 = unlimited)
        publish_max_per_second: u32 = 0,
    }
}

impl BrokerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn idle_wakeup(&self) -> Duration {
        Duration::from_millis(self.idle_wakeup_ms.max(1))
    }

    /// Reject values that would make a queue unusable
    pub fn validate(&self) -> Result<(), String> {
        let capacities = [
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("inbound_queue_capacity", self.inbound_queue_capacity),
            ("send_queue_capacity", self.send_queue_capacity),
            ("transport_buffer", self.transport_buffer),
            ("event_queue_capacity", self.event_queue_capacity),
            ("drain_batch", self.drain_batch),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(format!("broker.{} must be greater than 0", name));
            }
        }
        if self.pong_timeout_secs == 0 {
            return Err("broker.pong_timeout_secs must be greater than 0".to_string());
        }
        if !(self.rtt_alpha > 0.0 && self.rtt_alpha <= 1.0) {
            return Err(format!(
                "broker.rtt_alpha must be in (0, 1], got {}",
                self.rtt_alpha
            ));
        }
        Ok(())
    }
}

// ============================================================================
// WEBSERVER CONFIGURATION
// ============================================================================

config_struct! {
    /// WebSocket endpoint binding
    pub struct WebserverConfig {
        /// IP to bind: 127.0.0.1 = localhost only, 0.0.0.0 = all interfaces
        host: String = "0.0.0.0".to_string(),

        /// Port for the /ws/<topic> endpoints
        port: u16 = 8080,

        /// A socket write burst that has not finished by then closes the
        /// connection, so a dead peer cannot pin its socket task
        write_timeout_secs: u64 = 10,
    }
}

// ============================================================================
// DEMO TOPICS CONFIGURATION
// ============================================================================

config_struct! {
    /// Demo state owners registered by the binary
    pub struct DemoConfig {
        /// Register the "light" topic
        light_enabled: bool = true,

        /// Register the "system" status topic
        system_enabled: bool = true,

        /// How often the system status reader publishes
        system_poll_secs: u64 = 5,
    }
}

// ============================================================================
// ROOT CONFIGURATION
// ============================================================================

config_struct! {
    /// Root configuration structure containing all sub-configurations
    pub struct Config {
        /// Broker configuration
        broker: BrokerConfig = BrokerConfig::default(),

        /// Webserver configuration
        webserver: WebserverConfig = WebserverConfig::default(),

        /// Demo topics configuration
        demo: DemoConfig = DemoConfig::default(),
    }
}

/// Demo topics served by the binary
///
/// - `light`: a light controller clients can switch and tune
/// - `system`: a read-only status snapshot refreshed on a timer
///
/// Both are ordinary state owners: the broker only sees them through
/// `TopicState`.
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::{
    broker::{
        message::SERVER_ORIGIN, shared, update_field, BrokerHandle, SharedState, StateBody,
        StateUpdateResult, TopicRegistry, TopicState,
    },
    config::DemoConfig,
    errors::BrokerError,
    logger::{self, LogTag},
};

pub const LIGHT_TOPIC: &str = "light";
pub const SYSTEM_TOPIC: &str = "system";

const GAIN_MIN: i64 = 10;
const GAIN_MAX: i64 = 60;

// ============================================================================
// LIGHT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LightState {
    pub on: bool,
    pub gain: i64,
    pub daily_consumption_limit: f64,
    pub monthly_consumption_limit: f64,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            on: false,
            gain: 20,
            daily_consumption_limit: 0.0,
            monthly_consumption_limit: 0.0,
        }
    }
}

impl TopicState for LightState {
    fn read(&self, root: &mut StateBody) {
        root.insert("on".to_string(), json!(self.on));
        root.insert("gain".to_string(), json!(self.gain));
        root.insert(
            "daily_consumption_limit".to_string(),
            json!(self.daily_consumption_limit),
        );
        root.insert(
            "monthly_consumption_limit".to_string(),
            json!(self.monthly_consumption_limit),
        );
    }

    fn update(&mut self, root: &StateBody) -> StateUpdateResult {
        // Validate first so a rejected body leaves every field untouched
        if let Some(gain) = root.get("gain").and_then(|v| v.as_i64()) {
            if !(GAIN_MIN..=GAIN_MAX).contains(&gain) {
                return StateUpdateResult::Error;
            }
        }
        let switch = match root.get("state").and_then(|v| v.as_str()) {
            Some("ON") => Some(true),
            Some("OFF") => Some(false),
            Some(_) => return StateUpdateResult::Error,
            None => None,
        };

        let mut changed = false;
        changed |= update_field(root, "on", &mut self.on);
        if let Some(on) = switch {
            changed |= self.on != on;
            self.on = on;
        }
        changed |= update_field(root, "gain", &mut self.gain);
        changed |= update_field(root, "daily_consumption_limit", &mut self.daily_consumption_limit);
        changed |= update_field(
            root,
            "monthly_consumption_limit",
            &mut self.monthly_consumption_limit,
        );
        StateUpdateResult::from_changed(changed)
    }
}

// ============================================================================
// SYSTEM STATUS
// ============================================================================

/// System status snapshot, refreshed by the poller
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub uptime_secs: i64,
    pub active_connections: usize,
    pub frames_sent: u64,
    pub overflow_drops: u64,
    pub evictions: u64,
    pub rtt_avg_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    started: DateTime<Utc>,
}

impl Default for SystemStatus {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uptime_secs: 0,
            active_connections: 0,
            frames_sent: 0,
            overflow_drops: 0,
            evictions: 0,
            rtt_avg_ms: None,
            timestamp: now,
            started: now,
        }
    }
}

impl SystemStatus {
    /// Refresh from the broker's own counters
    pub fn refresh(&mut self, broker: &BrokerHandle) {
        let metrics = broker.metrics().snapshot();
        let now = Utc::now();
        self.uptime_secs = (now - self.started).num_seconds();
        self.active_connections = metrics.active_connections;
        self.frames_sent = metrics.frames_sent;
        self.overflow_drops = metrics.overflow_drops;
        self.evictions = metrics.evictions;
        self.rtt_avg_ms = metrics.rtt_avg_ms;
        self.timestamp = now;
    }
}

impl TopicState for SystemStatus {
    fn read(&self, root: &mut StateBody) {
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) {
            root.extend(map);
        }
    }

    /// Read-only topic
    fn update(&mut self, _root: &StateBody) -> StateUpdateResult {
        StateUpdateResult::Error
    }
}

// ============================================================================
// REGISTRATION
// ============================================================================

/// State owners created for the enabled demo topics
#[derive(Default)]
pub struct DemoTopics {
    pub light: Option<SharedState<LightState>>,
    pub system: Option<SharedState<SystemStatus>>,
}

/// Register the demo topics enabled in `config`
pub fn register_demo_topics(
    registry: &mut TopicRegistry,
    config: &DemoConfig,
) -> Result<DemoTopics, BrokerError> {
    let mut topics = DemoTopics::default();

    if config.light_enabled {
        let light = shared(LightState::default());
        registry.register_state(LIGHT_TOPIC, light.clone())?;
        topics.light = Some(light);
    }

    if config.system_enabled {
        let system = shared(SystemStatus::default());
        registry.register_state(SYSTEM_TOPIC, system.clone())?;
        topics.system = Some(system);
    }

    logger::debug(
        LogTag::Demo,
        &format!("Demo topics registered: {:?}", registry.identifiers()),
    );

    Ok(topics)
}

/// Refresh and publish the system topic every `poll_secs`
pub fn start_system_poller(
    broker: BrokerHandle,
    system: SharedState<SystemStatus>,
    poll_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));

        loop {
            ticker.tick().await;

            system.write().refresh(&broker);

            match broker.publish(SYSTEM_TOPIC, SERVER_ORIGIN) {
                Ok(()) => {}
                Err(BrokerError::Stopped) => break,
                Err(e) => logger::warning(
                    LogTag::Demo,
                    &format!("System status publish dropped: {}", e),
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use std::sync::Arc;

    fn body(value: serde_json::Value) -> StateBody {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_light_update() {
        let mut light = LightState::default();

        assert_eq!(light.update(&body(json!({"on": true}))), StateUpdateResult::Changed);
        assert!(light.on);
        assert_eq!(light.update(&body(json!({"on": true}))), StateUpdateResult::Unchanged);
        assert_eq!(light.update(&body(json!({"state": "OFF"}))), StateUpdateResult::Changed);
        assert!(!light.on);
        assert_eq!(light.update(&body(json!({"gain": 42}))), StateUpdateResult::Changed);
        assert_eq!(light.gain, 42);
    }

    #[test]
    fn test_light_rejects_invalid_without_partial_apply() {
        let mut light = LightState::default();

        assert_eq!(
            light.update(&body(json!({"on": true, "gain": 99}))),
            StateUpdateResult::Error
        );
        assert_eq!(
            light.update(&body(json!({"on": true, "state": "DIM"}))),
            StateUpdateResult::Error
        );
        assert_eq!(light, LightState::default());
    }

    #[test]
    fn test_system_topic_is_read_only() {
        let mut status = SystemStatus::default();
        let mut root = StateBody::new();
        status.read(&mut root);

        assert!(root.contains_key("uptime_secs"));
        assert!(!root.contains_key("started"));
        assert_eq!(status.update(&body(json!({"uptime_secs": 5}))), StateUpdateResult::Error);
    }

    #[test]
    fn test_register_respects_config() {
        let mut registry = TopicRegistry::new();
        let mut config = DemoConfig::default();
        config.system_enabled = false;

        let topics = register_demo_topics(&mut registry, &config).unwrap();
        assert!(topics.light.is_some());
        assert!(topics.system.is_none());
        assert_eq!(registry.identifiers(), vec![LIGHT_TOPIC.to_string()]);

        assert!(matches!(
            register_demo_topics(&mut registry, &config),
            Err(BrokerError::DuplicateTopic { .. })
        ));
    }

    #[tokio::test]
    async fn test_system_status_reflects_broker_metrics() {
        let mut registry = TopicRegistry::new();
        let topics = register_demo_topics(&mut registry, &DemoConfig::default()).unwrap();
        let (_broker, handle) = Broker::new(&BrokerConfig::default(), Arc::new(registry));

        handle.metrics().connection_opened();
        let system = topics.system.unwrap();
        system.write().refresh(&handle);
        assert_eq!(system.read().active_connections, 1);
    }
}

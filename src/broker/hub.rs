/// Central broker hub - dispatch loop and producer handle
///
/// The hub is the core of the broker. One task runs `Broker::run` and
/// exclusively owns:
/// - The connection table (topic + send queue per connection)
/// - The liveness table
/// - The consumer ends of the outbound, inbound and event queues
///
/// Everything else talks to it through a cloneable `BrokerHandle`, which
/// only ever enqueues: publishes and client frames go through bounded
/// queues, lifecycle events through a bounded event channel.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{
    arguments::{is_debug_broker_enabled, is_debug_liveness_enabled},
    config::BrokerConfig,
    errors::BrokerError,
    logger::{self, LogTag},
};

use super::health::LivenessMonitor;
use super::message::{
    client_origin, parse_update_body, Frame, FrameMode, InboundMessage, OutboundMessage,
    WsEnvelope, SERVER_ORIGIN,
};
use super::metrics::{ConnectionStats, HubMetrics};
use super::queue::{bounded, QueueConsumer, QueueProducer};
use super::send_queue::{ConnectionSender, EnqueueOutcome, Outgoing, SendQueue};
use super::throttle::PublishThrottle;
use super::topics::{StateUpdateResult, TopicRegistry};

// ============================================================================
// HUB TYPES
// ============================================================================

/// Connection ID (unique per connection, never reused)
pub type ConnectionId = u64;

/// Lifecycle events delivered to the dispatch loop
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        id: ConnectionId,
        topic: String,
        sink: ConnectionSender,
    },
    Disconnected {
        id: ConnectionId,
    },
    Pong {
        id: ConnectionId,
    },
    /// Transport drained its buffer and can take more frames
    Writable {
        id: ConnectionId,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionSnapshot>>,
    },
    Shutdown,
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub topic: String,
    pub stats: ConnectionStats,
}

struct ConnectionEntry {
    topic: String,
    queue: SendQueue,
}

// ============================================================================
// BROKER CORE
// ============================================================================

/// Dispatch state, driven one event at a time by the loop
///
/// Every handler is synchronous; the loop only decides what to feed in next.
pub struct BrokerCore {
    registry: Arc<TopicRegistry>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    liveness: LivenessMonitor,
    outbound: QueueProducer<OutboundMessage>,
    metrics: Arc<HubMetrics>,
    send_queue_capacity: usize,
}

impl BrokerCore {
    fn new(
        config: &BrokerConfig,
        registry: Arc<TopicRegistry>,
        outbound: QueueProducer<OutboundMessage>,
        metrics: Arc<HubMetrics>,
        now: Instant,
    ) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            liveness: LivenessMonitor::new(
                config.ping_interval(),
                config.pong_timeout(),
                config.rtt_alpha,
                now,
            ),
            outbound,
            metrics,
            send_queue_capacity: config.send_queue_capacity,
        }
    }

    pub fn handle_event(&mut self, event: HubEvent, now: Instant) {
        match event {
            HubEvent::Connected { id, topic, sink } => self.on_connect(id, topic, sink, now),
            HubEvent::Disconnected { id } => {
                self.on_disconnect(id, "closed");
            }
            HubEvent::Pong { id } => self.on_pong(id, now),
            HubEvent::Writable { id } => self.on_writable(id),
            HubEvent::Connections { reply } => {
                let _ = reply.send(self.connection_snapshots());
            }
            HubEvent::Shutdown => {}
        }
    }

    /// Register a connection, announce its id and send it the topic's state
    pub fn on_connect(&mut self, id: ConnectionId, topic: String, sink: ConnectionSender, now: Instant) {
        let snapshot = match self.registry.lookup(&topic) {
            Ok(binding) => binding.serialize(),
            Err(e) => {
                logger::warning(
                    LogTag::Broker,
                    &format!("Connection {} rejected: {}", id, e),
                );
                let _ = sink.try_send(Outgoing::Close);
                return;
            }
        };

        self.connections.insert(
            id,
            ConnectionEntry {
                topic: topic.clone(),
                queue: SendQueue::new(id, sink, self.send_queue_capacity),
            },
        );
        self.liveness.add(id, now);
        self.metrics.connection_opened();

        logger::info(
            LogTag::Broker,
            &format!(
                "Connection {} subscribed to '{}' (active={})",
                id,
                topic,
                self.connections.len()
            ),
        );

        let identity = match WsEnvelope::identity(id).to_json() {
            Ok(json) => Frame::text(json),
            Err(e) => {
                logger::error(LogTag::Broker, &format!("Identity frame for {}: {}", id, e));
                return;
            }
        };
        let state = match OutboundMessage::state(&topic, SERVER_ORIGIN, snapshot) {
            Ok(msg) => msg.into_frame(),
            Err(e) => {
                logger::error(LogTag::Broker, &format!("Snapshot of '{}': {}", topic, e));
                return;
            }
        };

        if self.deliver(id, identity).is_ok() {
            let _ = self.deliver(id, state);
        }
    }

    /// Tear down a connection; returns false when it was already gone
    pub fn on_disconnect(&mut self, id: ConnectionId, reason: &str) -> bool {
        self.teardown(id, reason)
    }

    pub fn on_pong(&mut self, id: ConnectionId, now: Instant) {
        let Some(sample) = self.liveness.on_pong(id, now) else {
            return;
        };

        if let Some(avg) = self.liveness.global_rtt_ms() {
            self.metrics.set_rtt_avg_ms(avg);
        }
        let conn_avg = self.liveness.connection_rtt_ms(id);
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.queue.stats_mut().rtt_avg_ms = conn_avg;
        }

        if is_debug_liveness_enabled() {
            logger::debug(
                LogTag::Liveness,
                &format!(
                    "Connection {}: pong rtt={}ms avg={:.1}ms",
                    id,
                    sample.as_millis(),
                    conn_avg.unwrap_or_default()
                ),
            );
        }
    }

    pub fn on_writable(&mut self, id: ConnectionId) {
        let result = match self.connections.get_mut(&id) {
            Some(entry) => entry.queue.drain(),
            None => return,
        };
        self.after_drain(id, result);
    }

    /// Parse a client frame, apply it to its topic and republish on change
    pub fn process_inbound(&mut self, msg: InboundMessage) {
        if msg.mode == FrameMode::Binary {
            self.metrics.malformed_payload();
            if is_debug_broker_enabled() {
                logger::debug(
                    LogTag::Broker,
                    &format!("Binary frame from {} on '{}' dropped", msg.source, msg.topic),
                );
            }
            return;
        }

        let binding = match self.registry.lookup(&msg.topic) {
            Ok(binding) => binding,
            Err(e) => {
                self.metrics.unknown_topic();
                if is_debug_broker_enabled() {
                    logger::debug(LogTag::Broker, &format!("Inbound from {}: {}", msg.source, e));
                }
                return;
            }
        };

        let body = match parse_update_body(&msg.payload) {
            Ok(body) => body,
            Err(e) => {
                self.metrics.malformed_payload();
                if is_debug_broker_enabled() {
                    logger::debug(
                        LogTag::Broker,
                        &format!("Inbound from {} on '{}': {}", msg.source, msg.topic, e),
                    );
                }
                return;
            }
        };

        match binding.update(&body) {
            StateUpdateResult::Changed => {
                self.metrics.inbound_applied();
                let origin = client_origin(msg.source);
                let republish = OutboundMessage::state(&msg.topic, origin, binding.serialize());
                match republish {
                    Ok(out) => {
                        if let Err(e) = self.outbound.try_enqueue(out) {
                            self.metrics.outbound_queue_full();
                            logger::warning(
                                LogTag::Broker,
                                &format!("Republish of '{}' dropped: {}", msg.topic, e),
                            );
                        } else {
                            self.metrics.message_published();
                        }
                    }
                    Err(e) => logger::error(
                        LogTag::Broker,
                        &format!("Serialize '{}' failed: {}", msg.topic, e),
                    ),
                }
            }
            StateUpdateResult::Unchanged => {
                if is_debug_broker_enabled() {
                    logger::debug(
                        LogTag::Broker,
                        &format!("Inbound from {} left '{}' unchanged", msg.source, msg.topic),
                    );
                }
            }
            StateUpdateResult::Error => {
                self.metrics.malformed_payload();
                if is_debug_broker_enabled() {
                    logger::debug(
                        LogTag::Broker,
                        &format!("Topic '{}' rejected update from {}", msg.topic, msg.source),
                    );
                }
            }
        }
    }

    /// Fan a message out to its topic's subscribers or to its target
    pub fn process_outbound(&mut self, msg: OutboundMessage) {
        let topic = msg.topic.clone();
        let target = msg.target;
        let frame = msg.into_frame();

        let recipients: Vec<ConnectionId> = match target {
            Some(id) if self.connections.contains_key(&id) => vec![id],
            Some(_) => Vec::new(),
            None => {
                let mut ids: Vec<ConnectionId> = self
                    .connections
                    .iter()
                    .filter(|(_, entry)| entry.topic == topic)
                    .map(|(id, _)| *id)
                    .collect();
                ids.sort_unstable();
                ids
            }
        };

        for id in &recipients {
            let _ = self.deliver(*id, frame.clone());
        }

        if is_debug_broker_enabled() && !recipients.is_empty() {
            logger::debug(
                LogTag::Broker,
                &format!("'{}' -> {} connection(s), {} bytes", topic, recipients.len(), frame.len()),
            );
        }
    }

    /// Liveness housekeeping: evict silent connections, then probe the rest
    pub fn tick(&mut self, now: Instant) {
        self.flush_pending();

        if !self.liveness.is_due(now) {
            return;
        }

        for id in self.liveness.expired(now) {
            self.metrics.connection_evicted();
            logger::warning(LogTag::Liveness, &format!("Connection {}: pong timeout", id));
            self.teardown(id, "pong timeout");
        }

        let mut probed = 0u64;
        let mut gone = Vec::new();
        for id in self.liveness.begin_probe(now) {
            let Some(entry) = self.connections.get(&id) else {
                continue;
            };
            match entry.queue.send_ping() {
                Ok(()) => probed += 1,
                Err(BrokerError::ConnectionGone(_)) => gone.push(id),
                Err(_) => {
                    if is_debug_liveness_enabled() {
                        logger::debug(
                            LogTag::Liveness,
                            &format!("Connection {}: transport busy, probe skipped", id),
                        );
                    }
                }
            }
        }
        for id in gone {
            self.teardown(id, "transport gone");
        }
        self.metrics.probes_sent(probed);
    }

    /// Retry every connection that still has frames waiting
    pub fn flush_pending(&mut self) {
        let pending: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, entry)| !entry.queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.on_writable(id);
        }
    }

    /// Tear down every connection
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.teardown(id, "shutdown");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_stats(&self, id: ConnectionId) -> Option<&ConnectionStats> {
        self.connections.get(&id).map(|entry| entry.queue.stats())
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn connection_snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut out: Vec<ConnectionSnapshot> = self
            .connections
            .iter()
            .map(|(id, entry)| ConnectionSnapshot {
                id: *id,
                topic: entry.topic.clone(),
                stats: entry.queue.stats().clone(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    fn deliver(&mut self, id: ConnectionId, frame: Frame) -> Result<(), BrokerError> {
        let Some(entry) = self.connections.get_mut(&id) else {
            return Err(BrokerError::ConnectionGone(id));
        };

        match entry.queue.enqueue_frame(frame) {
            Ok(EnqueueOutcome::Sent) => {
                self.metrics.frame_sent();
                Ok(())
            }
            Ok(EnqueueOutcome::Queued) => Ok(()),
            Ok(EnqueueOutcome::Dropped) => {
                self.metrics.overflow_drop();
                if is_debug_broker_enabled() {
                    logger::debug(
                        LogTag::Broker,
                        &format!(
                            "Connection {}: send queue full ({}), frame dropped",
                            id,
                            entry.queue.capacity()
                        ),
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.teardown(id, "transport gone");
                Err(e)
            }
        }
    }

    fn after_drain(&mut self, id: ConnectionId, result: Result<usize, BrokerError>) {
        match result {
            Ok(sent) => {
                for _ in 0..sent {
                    self.metrics.frame_sent();
                }
            }
            Err(_) => {
                self.teardown(id, "transport gone");
            }
        }
    }

    /// Single teardown path for close, error and eviction
    fn teardown(&mut self, id: ConnectionId, reason: &str) -> bool {
        let Some(mut entry) = self.connections.remove(&id) else {
            self.liveness.remove(id);
            return false;
        };

        let discarded = entry.queue.close();
        self.liveness.remove(id);
        self.metrics.connection_closed();

        logger::info(
            LogTag::Broker,
            &format!(
                "Connection {} closed: {} (sent={}, dropped={}, discarded={}, active={})",
                id,
                reason,
                entry.queue.stats().frames_sent,
                entry.queue.stats().overflow_drops,
                discarded,
                self.connections.len()
            ),
        );
        true
    }
}

// ============================================================================
// BROKER HANDLE
// ============================================================================

/// Cloneable producer side of the broker
#[derive(Clone)]
pub struct BrokerHandle {
    registry: Arc<TopicRegistry>,
    outbound: QueueProducer<OutboundMessage>,
    inbound: QueueProducer<InboundMessage>,
    events: mpsc::Sender<HubEvent>,
    next_conn_id: Arc<AtomicU64>,
    throttle: Arc<PublishThrottle>,
    metrics: Arc<HubMetrics>,
}

impl BrokerHandle {
    /// Serialize a topic's current state and queue it for every subscriber
    ///
    /// Call after mutating the state owner. `origin` is "" for server-side
    /// changes or the `ws:<id>` of the client that caused the change.
    pub fn publish(&self, topic: &str, origin: &str) -> Result<(), BrokerError> {
        if let Err(e) = self.throttle.check(topic, Instant::now()) {
            self.metrics.publish_throttled();
            return Err(e);
        }
        let body = self.registry.lookup(topic)?.serialize();
        self.enqueue_outbound(OutboundMessage::state(topic, origin, body)?)
    }

    /// Send a topic's current state to one connection only
    pub fn send_to(&self, topic: &str, connection: ConnectionId, origin: &str) -> Result<(), BrokerError> {
        let body = self.registry.lookup(topic)?.serialize();
        self.enqueue_outbound(OutboundMessage::state(topic, origin, body)?.with_target(connection))
    }

    /// Queue a pre-built frame for every subscriber of `topic`
    pub fn broadcast_raw(&self, topic: &str, payload: impl Into<Vec<u8>>, mode: FrameMode) -> Result<(), BrokerError> {
        self.enqueue_outbound(OutboundMessage::raw(topic, payload, mode))
    }

    /// Queue a pre-built frame for one connection
    pub fn send_raw(
        &self,
        topic: &str,
        connection: ConnectionId,
        payload: impl Into<Vec<u8>>,
        mode: FrameMode,
    ) -> Result<(), BrokerError> {
        self.enqueue_outbound(OutboundMessage::raw(topic, payload, mode).with_target(connection))
    }

    fn enqueue_outbound(&self, msg: OutboundMessage) -> Result<(), BrokerError> {
        match self.outbound.try_enqueue(msg) {
            Ok(()) => {
                self.metrics.message_published();
                Ok(())
            }
            Err(e) => {
                if matches!(e, BrokerError::QueueFull { .. }) {
                    self.metrics.outbound_queue_full();
                }
                Err(e)
            }
        }
    }

    /// Hand a raw client frame to the dispatch loop; dropped when full
    pub fn submit_inbound(&self, msg: InboundMessage) -> Result<(), BrokerError> {
        self.inbound.try_enqueue(msg).inspect_err(|e| {
            if matches!(e, BrokerError::QueueFull { .. }) {
                self.metrics.inbound_queue_full();
            }
        })
    }

    /// Allocate an id and register a connection subscribed to `topic`
    pub async fn connect(&self, topic: &str, sink: ConnectionSender) -> Result<ConnectionId, BrokerError> {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.events
            .send(HubEvent::Connected {
                id,
                topic: topic.to_string(),
                sink,
            })
            .await
            .map_err(|_| BrokerError::Stopped)?;
        Ok(id)
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        let _ = self.events.send(HubEvent::Disconnected { id }).await;
    }

    pub async fn pong(&self, id: ConnectionId) {
        let _ = self.events.send(HubEvent::Pong { id }).await;
    }

    /// Best-effort hint that a connection's transport has room again
    pub fn writable(&self, id: ConnectionId) {
        let _ = self.events.try_send(HubEvent::Writable { id });
    }

    /// Snapshot of every live connection, answered by the dispatch loop
    pub async fn connections(&self) -> Result<Vec<ConnectionSnapshot>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Connections { reply })
            .await
            .map_err(|_| BrokerError::Stopped)?;
        rx.await.map_err(|_| BrokerError::Stopped)
    }

    /// Ask the dispatch loop to close every connection and exit
    pub async fn shutdown(&self) {
        let _ = self.events.send(HubEvent::Shutdown).await;
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.registry.contains(topic)
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> Arc<HubMetrics> {
        self.metrics.clone()
    }
}

// ============================================================================
// BROKER (DISPATCH LOOP)
// ============================================================================

pub struct Broker {
    core: BrokerCore,
    outbound: QueueConsumer<OutboundMessage>,
    inbound: QueueConsumer<InboundMessage>,
    events: mpsc::Receiver<HubEvent>,
    idle_wakeup: Duration,
    drain_batch: usize,
}

impl Broker {
    /// Build the dispatch loop and its first handle
    pub fn new(config: &BrokerConfig, registry: Arc<TopicRegistry>) -> (Broker, BrokerHandle) {
        let (outbound_tx, outbound_rx) = bounded("outbound", config.outbound_queue_capacity);
        let (inbound_tx, inbound_rx) = bounded("inbound", config.inbound_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let metrics = HubMetrics::new();

        let throttle = PublishThrottle::new(
            Duration::from_millis(config.publish_min_interval_ms),
            config.publish_max_per_second,
        );

        let handle = BrokerHandle {
            registry: registry.clone(),
            outbound: outbound_tx.clone(),
            inbound: inbound_tx,
            events: events_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            throttle: Arc::new(throttle),
            metrics: metrics.clone(),
        };

        let broker = Broker {
            core: BrokerCore::new(config, registry, outbound_tx, metrics, Instant::now()),
            outbound: outbound_rx,
            inbound: inbound_rx,
            events: events_rx,
            idle_wakeup: config.idle_wakeup(),
            drain_batch: config.drain_batch.max(1),
        };

        (broker, handle)
    }

    /// Run the dispatch loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Dispatch until `Shutdown` arrives or every handle is dropped
    pub async fn run(mut self) {
        logger::info(
            LogTag::Broker,
            &format!("Dispatch loop started ({} topics)", self.core.registry.len()),
        );

        loop {
            let wait = self
                .idle_wakeup
                .min(self.core.liveness.until_due(Instant::now()))
                .max(Duration::from_millis(1));

            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(HubEvent::Shutdown) | None => break,
                    Some(event) => self.core.handle_event(event, Instant::now()),
                },

                Some(msg) = self.inbound.recv() => {
                    self.core.process_inbound(msg);
                    for _ in 1..self.drain_batch {
                        match self.inbound.try_dequeue() {
                            Some(msg) => self.core.process_inbound(msg),
                            None => break,
                        }
                    }
                }

                Some(msg) = self.outbound.recv() => {
                    self.core.process_outbound(msg);
                    for _ in 1..self.drain_batch {
                        match self.outbound.try_dequeue() {
                            Some(msg) => self.core.process_outbound(msg),
                            None => break,
                        }
                    }
                }

                _ = tokio::time::sleep(wait) => {}
            }

            self.core.tick(Instant::now());
        }

        self.core.shutdown();
        logger::info(LogTag::Broker, "Dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::topics::{shared, update_field, SharedState, StateBody, TopicState};
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Light {
        on: bool,
    }

    impl TopicState for Light {
        fn read(&self, root: &mut StateBody) {
            root.insert("on".to_string(), json!(self.on));
        }

        fn update(&mut self, root: &StateBody) -> StateUpdateResult {
            StateUpdateResult::from_changed(update_field(root, "on", &mut self.on))
        }
    }

    fn registry(light: SharedState<Light>) -> Arc<TopicRegistry> {
        let mut registry = TopicRegistry::new();
        registry.register_state("light", light).unwrap();
        registry
            .register(
                "gain",
                shared(20i64),
                |g, root| {
                    root.insert("gain".to_string(), json!(*g));
                },
                |root, g| StateUpdateResult::from_changed(update_field(root, "gain", g)),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn core_with(config: BrokerConfig) -> (BrokerCore, QueueConsumer<OutboundMessage>, SharedState<Light>) {
        let light = shared(Light::default());
        let (tx, rx) = bounded("outbound", config.outbound_queue_capacity);
        let core = BrokerCore::new(&config, registry(light.clone()), tx, HubMetrics::new(), Instant::now());
        (core, rx, light)
    }

    fn frames(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outgoing::Frame(frame) = item {
                out.push(serde_json::from_str(frame.as_text().unwrap()).unwrap());
            }
        }
        out
    }

    fn connect(core: &mut BrokerCore, id: ConnectionId, topic: &str, buffer: usize) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(buffer);
        core.on_connect(id, topic.to_string(), tx, Instant::now());
        rx
    }

    #[test]
    fn test_connect_sends_identity_then_snapshot() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let mut rx = connect(&mut core, 7, "light", 8);

        assert_eq!(
            frames(&mut rx),
            vec![
                json!({"type": "id", "origin_id": "", "id": "ws:7"}),
                json!({"type": "p", "origin_id": "", "p": {"on": false}}),
            ]
        );
        assert!(core.is_connected(7));
        assert!(core.liveness().contains(7));
    }

    #[test]
    fn test_unknown_topic_connection_is_closed() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        core.on_connect(1, "nope".to_string(), tx, Instant::now());

        assert!(!core.is_connected(1));
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
    }

    #[test]
    fn test_publish_reaches_only_topic_subscribers() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let mut a = connect(&mut core, 1, "light", 8);
        let mut b = connect(&mut core, 2, "light", 8);
        let mut c = connect(&mut core, 3, "gain", 8);
        frames(&mut a);
        frames(&mut b);
        frames(&mut c);

        let body = json!({"on": false}).as_object().cloned().unwrap();
        core.process_outbound(OutboundMessage::state("light", "", body).unwrap());

        let expected = vec![json!({"type": "p", "origin_id": "", "p": {"on": false}})];
        assert_eq!(frames(&mut a), expected);
        assert_eq!(frames(&mut b), expected);
        assert!(frames(&mut c).is_empty());
    }

    #[test]
    fn test_targeted_message_to_missing_connection_is_noop() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let mut a = connect(&mut core, 1, "light", 8);
        frames(&mut a);

        core.process_outbound(OutboundMessage::raw("light", "x", FrameMode::Text).with_target(99));
        core.process_outbound(OutboundMessage::raw("light", "{}", FrameMode::Text).with_target(1));

        assert_eq!(frames(&mut a), vec![json!({})]);
    }

    #[test]
    fn test_inbound_change_is_republished_with_origin() {
        let (mut core, mut out, light) = core_with(BrokerConfig::default());
        let mut a = connect(&mut core, 4, "light", 8);
        frames(&mut a);

        core.process_inbound(InboundMessage::text("light", 4, r#"{"on":true}"#));
        assert!(light.read().on);

        let republish = out.try_dequeue().unwrap();
        assert_eq!(republish.origin, "ws:4");
        core.process_outbound(republish);
        assert_eq!(
            frames(&mut a),
            vec![json!({"type": "p", "origin_id": "ws:4", "p": {"on": true}})]
        );

        // Same value again: nothing to publish
        core.process_inbound(InboundMessage::text("light", 4, r#"{"type":"p","p":{"on":true}}"#));
        assert!(out.try_dequeue().is_none());
    }

    #[test]
    fn test_malformed_inbound_changes_nothing() {
        let (mut core, mut out, light) = core_with(BrokerConfig::default());
        let _a = connect(&mut core, 1, "light", 8);

        core.process_inbound(InboundMessage::text("light", 1, "{\"on\":"));
        core.process_inbound(InboundMessage::text("light", 1, "[true]"));
        core.process_inbound(InboundMessage::text("missing", 1, r#"{"on":true}"#));
        core.process_inbound(InboundMessage {
            topic: "light".to_string(),
            source: 1,
            payload: br#"{"on":true}"#.to_vec(),
            mode: FrameMode::Binary,
        });

        assert!(!light.read().on);
        assert!(out.try_dequeue().is_none());
        let snapshot = core.metrics.snapshot();
        assert_eq!(snapshot.malformed_payloads, 3);
        assert_eq!(snapshot.unknown_topics, 1);
    }

    #[test]
    fn test_overflow_keeps_order_and_drops_newest() {
        let mut config = BrokerConfig::default();
        config.send_queue_capacity = 3;
        let (mut core, _out, _light) = core_with(config);
        // Transport takes identity + snapshot, then is full
        let mut a = connect(&mut core, 1, "light", 2);
        assert_eq!(frames(&mut a).len(), 2);

        for n in 0..8 {
            core.process_outbound(OutboundMessage::raw("light", format!("{}", n), FrameMode::Text));
        }
        let mut delivered = frames(&mut a);
        for _ in 0..4 {
            core.on_writable(1);
            delivered.extend(frames(&mut a));
        }

        assert_eq!(delivered, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(core.connection_stats(1).unwrap().overflow_drops, 3);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let _a = connect(&mut core, 1, "light", 8);

        assert!(core.on_disconnect(1, "closed"));
        assert!(!core.on_disconnect(1, "closed"));
        assert!(!core.liveness().contains(1));
        assert_eq!(core.metrics.snapshot().active_connections, 0);
    }

    #[test]
    fn test_silent_connection_evicted_once() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(64);
        core.on_connect(1, "light".to_string(), tx, start);
        let (tx2, mut rx2) = mpsc::channel(64);
        core.on_connect(2, "light".to_string(), tx2, start);

        for tick in 1..=4u64 {
            let now = start + Duration::from_secs(10 * tick);
            core.on_pong(2, now);
            core.tick(now);
        }

        assert!(!core.is_connected(1));
        assert!(core.is_connected(2));
        let snapshot = core.metrics.snapshot();
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.active_connections, 1);

        let mut pings = 0;
        let mut closed = false;
        while let Ok(item) = rx.try_recv() {
            match item {
                Outgoing::Ping => pings += 1,
                Outgoing::Close => closed = true,
                Outgoing::Frame(_) => {}
            }
        }
        assert_eq!(pings, 3);
        assert!(closed);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_answering_connection_survives_long_interval() {
        let mut config = BrokerConfig::default();
        config.ping_interval_secs = 30;
        config.pong_timeout_secs = 10;
        let (mut core, _out, _light) = core_with(config);
        let start = Instant::now();
        let (tx, _rx) = mpsc::channel(64);
        core.on_connect(1, "light".to_string(), tx, start);

        let t1 = start + Duration::from_secs(30);
        core.tick(t1);
        assert!(core.is_connected(1));
        core.on_pong(1, t1 + Duration::from_millis(5));

        core.tick(start + Duration::from_secs(60));
        assert!(core.is_connected(1));

        // Ignores the second probe
        core.tick(start + Duration::from_secs(90));
        assert!(!core.is_connected(1));
        assert_eq!(core.metrics.snapshot().evictions, 1);
    }

    #[test]
    fn test_pong_feeds_rtt() {
        let (mut core, _out, _light) = core_with(BrokerConfig::default());
        let start = Instant::now();
        let (tx, _rx) = mpsc::channel(64);
        core.on_connect(1, "light".to_string(), tx, start);

        let t1 = start + Duration::from_secs(10);
        core.tick(t1);
        core.on_pong(1, t1 + Duration::from_millis(40));
        assert_eq!(core.connection_stats(1).unwrap().rtt_avg_ms, Some(40.0));

        let t2 = t1 + Duration::from_secs(10);
        core.tick(t2);
        core.on_pong(1, t2 + Duration::from_millis(100));
        let avg = core.connection_stats(1).unwrap().rtt_avg_ms.unwrap();
        assert!((avg - (0.3 * 100.0 + 0.7 * 40.0)).abs() < 1e-9);
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outgoing>) -> Value {
        loop {
            match rx.recv().await {
                Some(Outgoing::Frame(frame)) => {
                    return serde_json::from_str(frame.as_text().unwrap()).unwrap()
                }
                Some(_) => continue,
                None => panic!("connection closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_loop_end_to_end() {
        let light = shared(Light::default());
        let (broker, handle) = Broker::new(&BrokerConfig::default(), registry(light.clone()));
        let task = broker.spawn();

        let (tx, mut rx) = mpsc::channel(16);
        let id = handle.connect("light", tx).await.unwrap();
        assert_eq!(id, 1);

        assert_eq!(next_frame(&mut rx).await["type"], "id");
        assert_eq!(next_frame(&mut rx).await["p"], json!({"on": false}));

        handle
            .submit_inbound(InboundMessage::text("light", id, r#"{"on":true}"#))
            .unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            json!({"type": "p", "origin_id": "ws:1", "p": {"on": true}})
        );

        light.write().on = false;
        handle.publish("light", "").unwrap();
        assert_eq!(next_frame(&mut rx).await["p"], json!({"on": false}));

        let conns = handle.connections().await.unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].topic, "light");

        assert!(matches!(
            handle.publish("missing", ""),
            Err(BrokerError::TopicNotFound { .. })
        ));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_loop_evicts_silent_client() {
        let (broker, handle) = Broker::new(&BrokerConfig::default(), registry(shared(Light::default())));
        let task = broker.spawn();
        let start = Instant::now();

        let (tx, mut rx) = mpsc::channel(16);
        handle.connect("light", tx).await.unwrap();

        let mut pings = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
                Ok(Some(Outgoing::Ping)) => pings += 1,
                Ok(Some(Outgoing::Close)) => break,
                Ok(Some(Outgoing::Frame(_))) => {}
                Ok(None) => panic!("channel closed before Close"),
                Err(_) => panic!("silent client was never evicted"),
            }
        }

        // ping interval + pong timeout
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(40), "evicted early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(41), "evicted late: {:?}", elapsed);
        assert_eq!(pings, 3);
        assert_eq!(handle.metrics().snapshot().evictions, 1);
        assert_eq!(handle.metrics().snapshot().active_connections, 0);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wakeup_flushes_queued_frames() {
        let light = shared(Light::default());
        let (broker, handle) = Broker::new(&BrokerConfig::default(), registry(light.clone()));
        let task = broker.spawn();

        // Identity + snapshot fill the transport buffer
        let (tx, mut rx) = mpsc::channel(2);
        let id = handle.connect("light", tx).await.unwrap();

        light.write().on = true;
        handle.publish("light", "").unwrap();
        // Let the loop take both and go idle
        tokio::time::sleep(Duration::from_millis(10)).await;

        let conns = handle.connections().await.unwrap();
        assert_eq!(conns[0].id, id);
        assert_eq!(conns[0].stats.queue_size, 1);

        assert_eq!(next_frame(&mut rx).await["type"], "id");
        assert_eq!(next_frame(&mut rx).await["p"], json!({"on": false}));

        // No writable hint: only the loop's own wakeup can deliver this
        let queued = tokio::time::timeout(Duration::from_secs(1), next_frame(&mut rx))
            .await
            .unwrap();
        assert_eq!(queued["p"], json!({"on": true}));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_throttled() {
        let mut config = BrokerConfig::default();
        config.publish_min_interval_ms = 60_000;
        let (_broker, handle) = Broker::new(&config, registry(shared(Light::default())));

        handle.publish("light", "").unwrap();
        assert!(matches!(
            handle.publish("light", ""),
            Err(BrokerError::Throttled { .. })
        ));
        assert_eq!(handle.metrics().snapshot().throttled, 1);
    }

    #[tokio::test]
    async fn test_full_outbound_queue_rejects_publish() {
        let mut config = BrokerConfig::default();
        config.outbound_queue_capacity = 1;
        let (_broker, handle) = Broker::new(&config, registry(shared(Light::default())));

        handle.publish("light", "").unwrap();
        assert!(matches!(
            handle.publish("gain", ""),
            Err(BrokerError::QueueFull { queue: "outbound", .. })
        ));
        assert_eq!(handle.metrics().snapshot().outbound_queue_full, 1);
    }
}

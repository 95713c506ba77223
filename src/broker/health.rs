/// Connection liveness monitoring
///
/// Tracks every connection with a last-seen timestamp and a small state
/// machine driven by the dispatch loop's tick:
///
/// `Connected -> (probe) -> AwaitingPong -> (pong) -> Connected`
///
/// A connection whose last pong is older than the pong timeout is reported
/// as expired and torn down by the caller. Round-trip time is smoothed with
/// an exponentially weighted moving average, globally and per connection.
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::hub::ConnectionId;

// ============================================================================
// RTT ESTIMATION
// ============================================================================

/// Exponentially weighted moving average step
///
/// The first sample seeds the average; afterwards
/// `avg' = alpha * sample + (1 - alpha) * avg`.
pub fn ewma(prev: f64, sample: f64, alpha: f64, first: bool) -> f64 {
    if first {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * prev
    }
}

/// Smoothed round-trip time in milliseconds
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    avg_ms: f64,
    samples: u64,
}

impl RttEstimator {
    /// Feed one sample, returns the new average
    pub fn record(&mut self, sample: Duration, alpha: f64) -> f64 {
        let sample_ms = sample.as_micros() as f64 / 1000.0;
        self.avg_ms = ewma(self.avg_ms, sample_ms, alpha, self.samples == 0);
        self.samples += 1;
        self.avg_ms
    }

    pub fn average_ms(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.avg_ms)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

// ============================================================================
// LIVENESS ENTRIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Connected,
    AwaitingPong,
}

#[derive(Debug, Clone)]
pub struct LivenessEntry {
    pub state: LivenessState,
    pub last_seen: Instant,
    pub rtt: RttEstimator,
}

impl LivenessEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: LivenessState::Connected,
            last_seen: now,
            rtt: RttEstimator::default(),
        }
    }
}

// ============================================================================
// LIVENESS MONITOR
// ============================================================================

pub struct LivenessMonitor {
    entries: HashMap<ConnectionId, LivenessEntry>,
    ping_interval: Duration,
    pong_timeout: Duration,
    alpha: f64,
    /// When the last tick ran
    last_tick: Instant,
    /// When the last probe went out, the base for RTT samples
    probe_at: Option<Instant>,
    global_rtt: RttEstimator,
}

impl LivenessMonitor {
    pub fn new(ping_interval: Duration, pong_timeout: Duration, alpha: f64, now: Instant) -> Self {
        Self {
            entries: HashMap::new(),
            ping_interval,
            pong_timeout,
            alpha,
            last_tick: now,
            probe_at: None,
            global_rtt: RttEstimator::default(),
        }
    }

    pub fn add(&mut self, id: ConnectionId, now: Instant) {
        self.entries.insert(id, LivenessEntry::new(now));
    }

    /// Forget a connection; false when it was already gone
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&LivenessEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a full ping interval has passed since the last tick
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_tick) >= self.ping_interval
    }

    /// Time until the next tick is due
    pub fn until_due(&self, now: Instant) -> Duration {
        (self.last_tick + self.ping_interval).saturating_duration_since(now)
    }

    /// Probed connections whose last pong is older than the pong timeout
    ///
    /// Only `AwaitingPong` entries can expire; a connection that answered
    /// the last probe is kept however long the ping interval is.
    pub fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state == LivenessState::AwaitingPong
                    && now.saturating_duration_since(e.last_seen) > self.pong_timeout
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Start a probe round: every connection now awaits a pong
    ///
    /// Returns the ids to send a ping to.
    pub fn begin_probe(&mut self, now: Instant) -> Vec<ConnectionId> {
        self.last_tick = now;
        self.probe_at = Some(now);
        let mut ids = Vec::with_capacity(self.entries.len());
        for (id, entry) in self.entries.iter_mut() {
            entry.state = LivenessState::AwaitingPong;
            ids.push(*id);
        }
        ids.sort_unstable();
        ids
    }

    /// Record a pong; returns the RTT sample when a probe was outstanding
    pub fn on_pong(&mut self, id: ConnectionId, now: Instant) -> Option<Duration> {
        let entry = self.entries.get_mut(&id)?;
        entry.last_seen = now;

        if entry.state != LivenessState::AwaitingPong {
            return None;
        }
        entry.state = LivenessState::Connected;

        let sample = now.saturating_duration_since(self.probe_at?);
        entry.rtt.record(sample, self.alpha);
        self.global_rtt.record(sample, self.alpha);
        Some(sample)
    }

    pub fn global_rtt_ms(&self) -> Option<f64> {
        self.global_rtt.average_ms()
    }

    pub fn connection_rtt_ms(&self, id: ConnectionId) -> Option<f64> {
        self.entries.get(&id).and_then(|e| e.rtt.average_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> LivenessMonitor {
        LivenessMonitor::new(Duration::from_secs(10), Duration::from_secs(30), 0.3, now)
    }

    #[test]
    fn test_ewma() {
        assert_eq!(ewma(0.0, 40.0, 0.3, true), 40.0);
        let avg = ewma(40.0, 100.0, 0.3, false);
        assert!((avg - 58.0).abs() < 1e-9);
    }

    #[test]
    fn test_rtt_first_sample_then_smoothed() {
        let mut rtt = RttEstimator::default();
        assert_eq!(rtt.average_ms(), None);

        assert_eq!(rtt.record(Duration::from_millis(20), 0.3), 20.0);
        let avg = rtt.record(Duration::from_millis(50), 0.3);
        assert!((avg - (0.3 * 50.0 + 0.7 * 20.0)).abs() < 1e-9);
        assert_eq!(rtt.samples(), 2);
    }

    #[test]
    fn test_probe_and_pong_cycle() {
        let start = Instant::now();
        let mut live = monitor(start);
        live.add(1, start);

        assert!(!live.is_due(start + Duration::from_secs(5)));
        let t1 = start + Duration::from_secs(10);
        assert!(live.is_due(t1));
        assert_eq!(live.begin_probe(t1), vec![1]);
        assert_eq!(live.get(1).unwrap().state, LivenessState::AwaitingPong);

        let sample = live.on_pong(1, t1 + Duration::from_millis(25));
        assert_eq!(sample, Some(Duration::from_millis(25)));
        assert_eq!(live.get(1).unwrap().state, LivenessState::Connected);
        assert_eq!(live.connection_rtt_ms(1), Some(25.0));
        assert_eq!(live.global_rtt_ms(), Some(25.0));

        // Unsolicited pong refreshes last_seen without an RTT sample
        assert_eq!(live.on_pong(1, t1 + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_silent_connection_expires_within_window() {
        let start = Instant::now();
        let mut live = monitor(start);
        live.add(1, start);
        live.add(2, start);

        let mut evicted_at = None;
        for tick in 1..=5u64 {
            let now = start + Duration::from_secs(10 * tick);
            live.on_pong(2, now);
            let expired = live.expired(now);
            if !expired.is_empty() {
                assert_eq!(expired, vec![1]);
                for id in expired {
                    assert!(live.remove(id));
                }
                evicted_at = Some(now);
                break;
            }
            live.begin_probe(now);
        }

        // ping interval + pong timeout
        assert_eq!(evicted_at, Some(start + Duration::from_secs(40)));
        assert!(!live.contains(1));
        assert!(live.contains(2));
        assert!(!live.remove(1));
    }

    #[test]
    fn test_unprobed_connection_never_expires() {
        let start = Instant::now();
        let mut live = LivenessMonitor::new(Duration::from_secs(30), Duration::from_secs(10), 0.3, start);
        live.add(1, start);
        live.add(2, start);

        // First tick: nobody was probed yet, nobody expires
        let t1 = start + Duration::from_secs(30);
        assert!(live.expired(t1).is_empty());
        assert_eq!(live.begin_probe(t1), vec![1, 2]);
        live.on_pong(1, t1 + Duration::from_millis(5));

        // Second tick: only the connection that ignored the probe expires
        let t2 = start + Duration::from_secs(60);
        assert_eq!(live.expired(t2), vec![2]);
    }

    #[test]
    fn test_unknown_pong_ignored() {
        let now = Instant::now();
        let mut live = monitor(now);
        assert_eq!(live.on_pong(42, now), None);
        assert!(live.is_empty());
    }
}

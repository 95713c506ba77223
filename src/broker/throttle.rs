/// Per-topic publish throttle
///
/// Limits how often a state owner can push one topic: a minimum gap between
/// publishes and a cap per one-second window. Both limits are off at 0.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::BrokerError;

#[derive(Debug, Clone, Copy)]
struct TopicWindow {
    last_publish: Instant,
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct PublishThrottle {
    min_interval: Duration,
    max_per_second: u32,
    windows: Mutex<HashMap<String, TopicWindow>>,
}

impl PublishThrottle {
    pub fn new(min_interval: Duration, max_per_second: u32) -> Self {
        Self {
            min_interval,
            max_per_second,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.min_interval.is_zero() || self.max_per_second > 0
    }

    /// Admit or reject one publish of `topic` at `now`
    pub fn check(&self, topic: &str, now: Instant) -> Result<(), BrokerError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(topic) else {
            windows.insert(
                topic.to_string(),
                TopicWindow {
                    last_publish: now,
                    window_start: now,
                    count: 1,
                },
            );
            return Ok(());
        };

        if now.saturating_duration_since(window.last_publish) < self.min_interval {
            return Err(BrokerError::Throttled {
                topic: topic.to_string(),
            });
        }

        if now.saturating_duration_since(window.window_start) >= Duration::from_secs(1) {
            window.window_start = now;
            window.count = 0;
        }
        if self.max_per_second > 0 && window.count >= self.max_per_second {
            return Err(BrokerError::Throttled {
                topic: topic.to_string(),
            });
        }

        window.count += 1;
        window.last_publish = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_admits_everything() {
        let throttle = PublishThrottle::new(Duration::ZERO, 0);
        assert!(!throttle.is_enabled());
        let now = Instant::now();
        for _ in 0..100 {
            assert!(throttle.check("light", now).is_ok());
        }
    }

    #[test]
    fn test_min_interval() {
        let throttle = PublishThrottle::new(Duration::from_millis(100), 0);
        let t0 = Instant::now();

        assert!(throttle.check("light", t0).is_ok());
        assert!(matches!(
            throttle.check("light", t0 + Duration::from_millis(50)),
            Err(BrokerError::Throttled { .. })
        ));
        // Other topics are independent
        assert!(throttle.check("system", t0 + Duration::from_millis(50)).is_ok());
        assert!(throttle.check("light", t0 + Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_max_per_second_window() {
        let throttle = PublishThrottle::new(Duration::ZERO, 2);
        let t0 = Instant::now();

        assert!(throttle.check("light", t0).is_ok());
        assert!(throttle.check("light", t0 + Duration::from_millis(10)).is_ok());
        assert!(throttle.check("light", t0 + Duration::from_millis(20)).is_err());
        assert!(throttle.check("light", t0 + Duration::from_secs(1)).is_ok());
    }
}

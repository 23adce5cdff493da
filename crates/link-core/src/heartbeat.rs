//! Heartbeat bookkeeping for connection liveness.
//!
//! The peer only answers heartbeats; deciding when to send them and when to
//! give up is left to whoever owns the connection. `HeartbeatMonitor` holds
//! that policy's state. The caller is responsible for:
//! - Calling `tick()` once per interval while the session is established
//! - Sending the returned `HeartBeat`
//! - Feeding replies to `on_reply()`
//! - Closing the connection on `HeartbeatAction::TimedOut`

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::message::HeartBeat;

/// Configuration for heartbeat liveness checks.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to send a heartbeat (default: 30s)
    pub interval: Duration,
    /// Consecutive unanswered heartbeats before giving up (default: 5)
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 5,
        }
    }
}

/// What the owner should do after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatAction {
    Send(HeartBeat),
    /// Too many heartbeats went unanswered.
    TimedOut { missed: u32 },
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    /// Heartbeats sent since the last reply.
    missed: u32,
    last_sent: Option<DateTime<Utc>>,
    last_lag: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            missed: 0,
            last_sent: None,
            last_lag: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Advance one interval.
    pub fn tick(&mut self, now: DateTime<Utc>) -> HeartbeatAction {
        if self.missed >= self.config.max_missed {
            return HeartbeatAction::TimedOut {
                missed: self.missed,
            };
        }
        self.missed += 1;
        self.last_sent = Some(now);
        HeartbeatAction::Send(HeartBeat { timestamp: now })
    }

    /// Record a reply and its measured round-trip lag.
    pub fn on_reply(&mut self, lag: Duration) {
        self.missed = 0;
        self.last_lag = Some(lag);
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        self.last_sent
    }

    /// Round-trip time measured by the latest reply.
    pub fn lag(&self) -> Option<Duration> {
        self.last_lag
    }
}

/// Round-trip lag of a reply echoing `sent`, clamped at zero.
pub fn lag_since(sent: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - sent).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, seconds).unwrap()
    }

    fn monitor(max_missed: u32) -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            interval: Duration::from_secs(1),
            max_missed,
        })
    }

    #[test]
    fn test_tick_sends_heartbeat_with_time() {
        let mut monitor = monitor(3);
        assert_eq!(
            monitor.tick(t(1)),
            HeartbeatAction::Send(HeartBeat { timestamp: t(1) })
        );
        assert_eq!(monitor.missed(), 1);
        assert_eq!(monitor.last_sent(), Some(t(1)));
    }

    #[test]
    fn test_times_out_after_max_missed() {
        let mut monitor = monitor(2);
        assert!(matches!(monitor.tick(t(1)), HeartbeatAction::Send(_)));
        assert!(matches!(monitor.tick(t(2)), HeartbeatAction::Send(_)));
        assert_eq!(monitor.tick(t(3)), HeartbeatAction::TimedOut { missed: 2 });
    }

    #[test]
    fn test_reply_resets_missed_count() {
        let mut monitor = monitor(2);
        monitor.tick(t(1));
        monitor.tick(t(2));
        monitor.on_reply(Duration::from_millis(40));
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.lag(), Some(Duration::from_millis(40)));
        assert!(matches!(monitor.tick(t(3)), HeartbeatAction::Send(_)));
    }

    #[test]
    fn test_lag_since_clamps_clock_skew() {
        assert_eq!(lag_since(t(5), t(7)), Duration::from_secs(2));
        assert_eq!(lag_since(t(7), t(5)), Duration::ZERO);
    }

    #[test]
    fn test_default_config() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_missed, 5);
    }
}

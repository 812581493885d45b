//! Link telemetry: status changes, heartbeats and reconnect attempts.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection state of the relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// One telemetry sample. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Status {
        status: LinkStatus,
        timestamp: i64,
    },
    Heartbeat {
        #[serde(rename = "rttMs")]
        rtt_ms: u64,
        timestamp: i64,
    },
    Reconnect {
        /// Attempts since the transport was created; never decreases.
        attempts: u64,
        timestamp: i64,
    },
}

impl TelemetryEvent {
    pub fn timestamp(&self) -> i64 {
        match self {
            TelemetryEvent::Status { timestamp, .. }
            | TelemetryEvent::Heartbeat { timestamp, .. }
            | TelemetryEvent::Reconnect { timestamp, .. } => *timestamp,
        }
    }
}

/// Bounded window of recent round-trip samples.
#[derive(Debug, Clone)]
pub struct RttWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl RttWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, rtt_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    pub fn latest(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Ascending reconnect delays; attempts past the end reuse the last delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSchedule {
    steps: Vec<Duration>,
}

impl ReconnectSchedule {
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u64) -> Duration {
        if self.steps.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.saturating_sub(1) as usize).min(self.steps.len() - 1);
        self.steps[idx]
    }
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self::new([2, 5, 10].map(Duration::from_secs))
    }
}

/// Folds telemetry into a current view of the link.
#[derive(Debug, Clone)]
pub struct TelemetryMonitor {
    status: Option<LinkStatus>,
    rtt: RttWindow,
    reconnect_attempts: u64,
    last_timestamp: i64,
}

impl TelemetryMonitor {
    pub fn new(rtt_window: usize) -> Self {
        Self {
            status: None,
            rtt: RttWindow::new(rtt_window),
            reconnect_attempts: 0,
            last_timestamp: 0,
        }
    }

    pub fn observe(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Status { status, .. } => self.status = Some(*status),
            TelemetryEvent::Heartbeat { rtt_ms, .. } => self.rtt.push(*rtt_ms),
            TelemetryEvent::Reconnect { attempts, .. } => {
                self.reconnect_attempts = self.reconnect_attempts.max(*attempts);
            }
        }
        self.last_timestamp = self.last_timestamp.max(event.timestamp());
    }

    pub fn status(&self) -> Option<LinkStatus> {
        self.status
    }

    pub fn average_rtt_ms(&self) -> Option<f64> {
        self.rtt.average()
    }

    pub fn rtt(&self) -> &RttWindow {
        &self.rtt
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts
    }

    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_window_is_bounded() {
        let mut window = RttWindow::new(3);
        for rtt in [10, 20, 30, 40] {
            window.push(rtt);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(30.0));
        assert_eq!(window.latest(), Some(40));
    }

    #[test]
    fn test_schedule_caps_at_last_step() {
        let schedule = ReconnectSchedule::default();
        assert_eq!(schedule.delay_for(1), Duration::from_secs(2));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(5));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(10));
        assert_eq!(schedule.delay_for(9), Duration::from_secs(10));
    }

    #[test]
    fn test_monitor_keeps_counter_monotonic() {
        let mut monitor = TelemetryMonitor::new(10);
        monitor.observe(&TelemetryEvent::Reconnect {
            attempts: 3,
            timestamp: 1,
        });
        monitor.observe(&TelemetryEvent::Reconnect {
            attempts: 2,
            timestamp: 2,
        });
        monitor.observe(&TelemetryEvent::Status {
            status: LinkStatus::Connected,
            timestamp: 3,
        });
        assert_eq!(monitor.reconnect_attempts(), 3);
        assert_eq!(monitor.status(), Some(LinkStatus::Connected));
        assert_eq!(monitor.last_timestamp(), 3);
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let json = serde_json::to_value(TelemetryEvent::Heartbeat {
            rtt_ms: 42,
            timestamp: 7,
        })
        .unwrap();
        assert_eq!(json["kind"], "heartbeat");
        assert_eq!(json["rttMs"], 42);
    }
}

//! Reconnection policies (C5): backoff schedules, attempt accounting.

use std::time::Duration;

/// Either policy must be able to produce the next delay, reset its attempt
/// counter, and report whether a retry is currently pending. The adapter
/// only ever touches an instance through this trait.
pub trait ReconnectPolicy: Send + Sync {
    /// Returns the delay before the next attempt, or `None` once the policy
    /// is exhausted.
    fn next(&mut self) -> Option<Duration>;
    fn reset(&mut self);
    fn reconnecting(&self) -> bool;
    fn set_reconnecting(&mut self, value: bool);
}

/// Fixed sleep time, capped at `max_attempts` (`None` ⇒ infinite).
#[derive(Debug, Clone)]
pub struct RawReconnectPolicy {
    sleep_time: Duration,
    max_attempts: Option<u32>,
    attempt_number: u32,
    reconnecting: bool,
}

impl RawReconnectPolicy {
    pub fn new(sleep_time: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            sleep_time,
            max_attempts,
            attempt_number: 0,
            reconnecting: false,
        }
    }
}

impl ReconnectPolicy for RawReconnectPolicy {
    fn next(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && self.attempt_number >= max
        {
            return None;
        }
        self.attempt_number += 1;
        self.reconnecting = true;
        Some(self.sleep_time)
    }

    fn reset(&mut self) {
        self.attempt_number = 0;
        self.reconnecting = false;
    }

    fn reconnecting(&self) -> bool {
        self.reconnecting
    }

    fn set_reconnecting(&mut self, value: bool) {
        self.reconnecting = value;
    }
}

/// Finite sequence of delays; exhausted once all have been returned once.
#[derive(Debug, Clone)]
pub struct IntervalReconnectPolicy {
    intervals: Vec<Duration>,
    attempt_number: usize,
    reconnecting: bool,
}

impl IntervalReconnectPolicy {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self {
            intervals,
            attempt_number: 0,
            reconnecting: false,
        }
    }
}

impl ReconnectPolicy for IntervalReconnectPolicy {
    fn next(&mut self) -> Option<Duration> {
        let delay = self.intervals.get(self.attempt_number).copied()?;
        self.attempt_number += 1;
        self.reconnecting = true;
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt_number = 0;
        self.reconnecting = false;
    }

    fn reconnecting(&self) -> bool {
        self.reconnecting
    }

    fn set_reconnecting(&mut self, value: bool) {
        self.reconnecting = value;
    }
}

/// Which variant `HubConnectionOptions::reconnect` should build.
#[derive(Debug, Clone)]
pub enum ReconnectPolicyKind {
    Raw {
        sleep_time: Duration,
        max_attempts: Option<u32>,
    },
    Interval {
        intervals: Vec<Duration>,
    },
}

impl ReconnectPolicyKind {
    pub fn build(&self) -> Box<dyn ReconnectPolicy> {
        match self {
            Self::Raw {
                sleep_time,
                max_attempts,
            } => Box::new(RawReconnectPolicy::new(*sleep_time, *max_attempts)),
            Self::Interval { intervals } => {
                Box::new(IntervalReconnectPolicy::new(intervals.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_policy_caps_at_max_attempts_then_raises() {
        let mut policy = RawReconnectPolicy::new(Duration::from_secs(1), Some(2));
        assert_eq!(policy.next(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next(), None);
    }

    #[test]
    fn raw_policy_infinite_when_max_attempts_none() {
        let mut policy = RawReconnectPolicy::new(Duration::from_millis(10), None);
        for _ in 0..1000 {
            assert!(policy.next().is_some());
        }
    }

    #[test]
    fn raw_policy_reset_returns_first_delay_again() {
        let mut policy = RawReconnectPolicy::new(Duration::from_secs(1), Some(1));
        assert_eq!(policy.next(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next(), None);
        policy.reset();
        assert_eq!(policy.next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn interval_policy_returns_successive_values_then_raises() {
        let intervals = vec![
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(4),
        ];
        let mut policy = IntervalReconnectPolicy::new(intervals.clone());
        assert_eq!(policy.next(), Some(intervals[0]));
        assert_eq!(policy.next(), Some(intervals[1]));
        assert_eq!(policy.next(), Some(intervals[2]));
        assert_eq!(policy.next(), None);
    }

    #[test]
    fn interval_policy_reset_restarts_sequence() {
        let intervals = vec![Duration::from_millis(1), Duration::from_millis(2)];
        let mut policy = IntervalReconnectPolicy::new(intervals.clone());
        assert_eq!(policy.next(), Some(intervals[0]));
        policy.reset();
        assert_eq!(policy.next(), Some(intervals[0]));
        assert!(policy.reconnecting());
    }

    #[test]
    fn reconnecting_flag_tracks_pending_retry() {
        let mut policy = RawReconnectPolicy::new(Duration::from_millis(1), Some(5));
        assert!(!policy.reconnecting());
        policy.next();
        assert!(policy.reconnecting());
        policy.reset();
        assert!(!policy.reconnecting());
    }
}

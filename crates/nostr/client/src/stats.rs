//! Connection statistics, flapping detection and reconnect delays.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Counters and timings for one relay connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Connect attempts, manual and automatic
    pub attempts: u32,
    /// Attempts that produced an open socket
    pub successes: u32,
    /// Lengths of past sessions in milliseconds, oldest first
    pub durations: VecDeque<u64>,
    /// Start of the live session, `None` while disconnected
    pub connected_at: Option<Instant>,
    /// Start of the most recent session, kept after it ends
    pub last_connected_at: Option<Instant>,
    /// When the pending reconnect timer fires
    pub next_reconnect_at: Option<Instant>,
    window: usize,
}

impl ConnectionStats {
    /// Empty stats keeping at most `window` duration samples.
    pub fn new(window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            durations: VecDeque::with_capacity(window),
            connected_at: None,
            last_connected_at: None,
            next_reconnect_at: None,
            window,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self, now: Instant) {
        self.successes += 1;
        self.connected_at = Some(now);
        self.last_connected_at = Some(now);
    }

    /// Close the live session and push its length into the window.
    ///
    /// Returns the session length in milliseconds, or `None` if no session
    /// was live.
    pub fn record_disconnect(&mut self, now: Instant) -> Option<u64> {
        let started = self.connected_at.take()?;
        let millis = now.saturating_duration_since(started).as_millis() as u64;
        self.push_duration(millis);
        Some(millis)
    }

    pub fn push_duration(&mut self, millis: u64) {
        if self.window == 0 {
            return;
        }
        while self.durations.len() >= self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(millis);
    }

    /// Is the duration window showing a flapping pattern?
    pub fn is_flapping(&self, threshold_ms: f64) -> bool {
        let (front, back) = self.durations.as_slices();
        if back.is_empty() {
            return is_flapping(front, threshold_ms);
        }
        let samples: Vec<u64> = self.durations.iter().copied().collect();
        is_flapping(&samples, threshold_ms)
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Population mean and standard deviation of `samples`.
pub fn mean_and_stddev(samples: &[u64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    let variance = samples
        .iter()
        .map(|&s| {
            let diff = s as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / n;
    Some((mean, variance.sqrt()))
}

/// Flapping: a relay that keeps dropping after a near-constant interval.
///
/// Only judged when the sample count is a non-zero multiple of three.
/// Flapping when the population standard deviation is below `threshold_ms`.
pub fn is_flapping(durations: &[u64], threshold_ms: f64) -> bool {
    if durations.is_empty() || durations.len() % 3 != 0 {
        return false;
    }
    mean_and_stddev(durations).is_some_and(|(_, stddev)| stddev < threshold_ms)
}

/// Parameters of the reconnect delay.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    /// Sessions shorter than this are penalized by the remainder
    pub window: Duration,
    /// Linear step per attempt when the relay never connected
    pub step: Duration,
    /// First retry backoff after a failed automatic attempt
    pub initial: Duration,
    /// Upper bound on the retry backoff
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Base delay before the next attempt.
    ///
    /// After a session, the remainder of `window` since it started (zero
    /// for long-lived sessions). Otherwise `step * (attempts + 1)`.
    pub fn base_delay(&self, stats: &ConnectionStats, now: Instant) -> Duration {
        match stats.last_connected_at {
            Some(started) => self.window.saturating_sub(now.saturating_duration_since(started)),
            None => self.step.saturating_mul(stats.attempts.saturating_add(1)),
        }
    }

    /// Exponential backoff for the `retry`-th consecutive failed automatic
    /// attempt: zero for the first scheduling, then `initial * 2^(retry-1)`
    /// capped at `max`.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, stats: &ConnectionStats, retry: u32, now: Instant) -> Duration {
        self.base_delay(stats, now) + self.retry_backoff(retry)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            step: Duration::from_secs(5),
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

//! Backoff computation shared by retries and long-running polling
//!
//! Pure bookkeeping: the delay sequence, the per-attempt RPC timeout sequence
//! and the total-timeout deadline. Nothing here sleeps.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BackoffSettings;

/// Message used whenever a total timeout elapses.
pub const TOTAL_TIMEOUT_MESSAGE: &str = "Total timeout exceeded before any response was received";

/// Stateful walk over a [`BackoffSettings`] schedule
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    settings: BackoffSettings,
    attempt: usize,
    next_delay: Duration,
    next_rpc_timeout: Option<Duration>,
    deadline: Option<Instant>,
    jitter: bool,
}

impl BackoffPolicy {
    /// Start a schedule now; the deadline is `now + total_timeout`.
    pub fn new(settings: BackoffSettings) -> Self {
        Self::starting_at(settings, Instant::now())
    }

    /// Start a schedule at `start`.
    pub fn starting_at(settings: BackoffSettings, start: Instant) -> Self {
        Self {
            next_delay: settings.initial_retry_delay,
            next_rpc_timeout: settings.initial_rpc_timeout,
            deadline: settings.total_timeout.map(|total| start + total),
            settings,
            attempt: 0,
            jitter: false,
        }
    }

    /// Randomize each delay upward by up to 30%.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Whether the total timeout has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Calculate next delay with exponential backoff
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.next_delay;

        if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }

        self.attempt += 1;
        self.next_delay = grow(
            self.next_delay,
            self.settings.retry_delay_multiplier,
            self.settings.max_retry_delay,
        );

        delay
    }

    /// Timeout for the next physical attempt, clipped to the remaining total
    /// budget. `None` when neither an RPC timeout nor a deadline applies.
    pub fn next_rpc_timeout(&mut self, now: Instant) -> Option<Duration> {
        let current = self.next_rpc_timeout;
        if let Some(timeout) = current {
            let cap = self.settings.max_rpc_timeout.unwrap_or(Duration::MAX);
            self.next_rpc_timeout = Some(grow(
                timeout,
                self.settings.rpc_timeout_multiplier,
                cap,
            ));
        }
        match (current, self.remaining(now)) {
            (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
            (Some(timeout), None) => Some(timeout),
            (None, remaining) => remaining,
        }
    }

    /// Reset the schedule, keeping the original deadline.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.settings.initial_retry_delay;
        self.next_rpc_timeout = self.settings.initial_rpc_timeout;
    }
}

fn grow(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next = current.as_secs_f64() * multiplier;
    if !next.is_finite() || next >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(next.max(0.0))
    }
}

//! Reconnection scheduling: capped exponential backoff with jitter, plus a
//! sliding-window rate limit on attempts.
//!
//! The two mechanisms are independent. Backoff spaces out consecutive
//! failures of one client; the rate window caps how often any trigger
//! (timer, foreground, network online, user) may actually dial.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::EngineConfig;

/// Backoff parameters and the current attempt counter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempt_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            attempt_count: 0,
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.max(0.0),
        }
    }

    /// `min(base × 2^attempt, max)` without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff for the current attempt plus up to `jitter_factor × delay`,
    /// never above `max_delay`.
    pub fn jittered<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let delay = self.backoff(self.attempt_count);
        if self.jitter_factor == 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rng.gen_range(0.0..=self.jitter_factor));
        (delay + extra).min(self.max_delay)
    }
}

/// Timestamps of recent attempts within a trailing window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    cap: usize,
    attempts: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            window,
            cap: cap.max(1),
            attempts: VecDeque::with_capacity(cap.max(1)),
        }
    }

    /// Drop entries older than the window.
    pub fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.attempts.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_saturated(&mut self, now: Instant) -> bool {
        self.purge(now);
        self.attempts.len() >= self.cap
    }

    /// Record an attempt. Refused when saturated.
    pub fn record(&mut self, now: Instant) -> bool {
        if self.is_saturated(now) {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    /// Deferral used while saturated.
    pub fn spacing(&self) -> Duration {
        self.window / self.cap as u32
    }
}

/// Outcome of planning the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// Regular exponential backoff.
    Backoff(Duration),
    /// Rate window full; check again after the window spacing.
    Throttled(Duration),
}

impl ReconnectPlan {
    pub fn delay(&self) -> Duration {
        match self {
            ReconnectPlan::Backoff(d) | ReconnectPlan::Throttled(d) => *d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    window: RateWindow,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy, window: RateWindow) -> Self {
        Self { policy, window }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            ReconnectPolicy::new(config.base_delay, config.max_delay, config.jitter_factor),
            RateWindow::new(config.rate_window, config.max_attempts_per_window),
        )
    }

    pub fn attempt_count(&self) -> u32 {
        self.policy.attempt_count
    }

    /// Plan the delay before the next attempt.
    pub fn plan<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> ReconnectPlan {
        if self.window.is_saturated(now) {
            ReconnectPlan::Throttled(self.window.spacing())
        } else {
            ReconnectPlan::Backoff(self.policy.jittered(rng))
        }
    }

    /// Register an actual attempt. On saturation returns the deferral instead.
    pub fn begin_attempt(&mut self, now: Instant) -> Result<(), Duration> {
        if !self.window.record(now) {
            return Err(self.window.spacing());
        }
        self.policy.attempt_count = self.policy.attempt_count.saturating_add(1);
        Ok(())
    }

    /// Successful connect or user-triggered reconnect. The window keeps its
    /// history.
    pub fn reset(&mut self) {
        self.policy.attempt_count = 0;
    }

    pub fn attempts_in_window(&mut self, now: Instant) -> usize {
        self.window.purge(now);
        self.window.attempts.len()
    }
}

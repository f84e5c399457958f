//! Heartbeat monitor: periodic `ping` while connected, and stale detection
//! for half-open connections the transport never reports as closed.

use std::time::Duration;

use tokio::time::Instant;

/// What the engine should do when the heartbeat deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a liveness probe.
    Probe,
    /// No pong within the stale timeout; force-close the channel.
    Stale,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    stale_timeout: Duration,
    next_probe: Option<Instant>,
    stale_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, stale_timeout: Duration) -> Self {
        Self {
            interval,
            stale_timeout,
            next_probe: None,
            stale_at: None,
        }
    }

    /// Arm both timers. Called on transition to Connected.
    pub fn start(&mut self, now: Instant) {
        self.next_probe = Some(now + self.interval);
        self.stale_at = Some(now + self.stale_timeout);
    }

    /// Cancel both timers.
    pub fn stop(&mut self) {
        self.next_probe = None;
        self.stale_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_probe.is_some()
    }

    /// A pong arrived; re-arm the stale timer.
    pub fn on_pong(&mut self, now: Instant) {
        if self.is_running() {
            self.stale_at = Some(now + self.stale_timeout);
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_probe, self.stale_at) {
            (Some(p), Some(s)) => Some(p.min(s)),
            (p, s) => p.or(s),
        }
    }

    /// Advance to `now`. Stale detection wins over probing and stops the
    /// monitor.
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if self.stale_at.is_some_and(|at| at <= now) {
            self.stop();
            return Some(HeartbeatAction::Stale);
        }
        if self.next_probe.is_some_and(|at| at <= now) {
            self.next_probe = Some(now + self.interval);
            return Some(HeartbeatAction::Probe);
        }
        None
    }
}

//! Connection state machine.
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting ──── open ok ───► Connected
//!       ▲                          │                            │
//!       └──── open failed ─────────┘                            │
//!       └──── close / error / stale / disconnect() ─────────────┘
//! ```
//!
//! The machine only decides; the engine performs the I/O and timers that a
//! decision calls for.

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why the channel went away (or never came up).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Transport dropped, errored, or the attempt timed out.
    Network(String),
    /// Heartbeat saw no pong within the stale timeout.
    Stale,
    /// Handshake rejected the credential.
    Unauthorized(String),
}

/// What the engine must do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Plan the next attempt with the reconnection scheduler.
    Reconnect,
    /// Ask the credential source for a fresh credential first.
    RefreshCredential,
    /// Surface an authentication failure and stop retrying.
    Fatal,
    /// The session was torn down on purpose; do nothing.
    Ignore,
}

#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    /// Set by `disconnect()`, cleared by `connect()`.
    explicit_close: bool,
    /// No attempts until a new credential is supplied.
    auth_blocked: bool,
    /// A refresh already happened since the last successful open.
    refreshed: bool,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_auth_blocked(&self) -> bool {
        self.auth_blocked
    }

    /// Whether background triggers (timers, foreground, network online) may
    /// start an attempt right now.
    pub fn can_auto_connect(&self) -> bool {
        self.state == ConnectionState::Disconnected && !self.explicit_close && !self.auth_blocked
    }

    /// Forget an earlier `disconnect()` so automatic attempts may resume.
    pub fn clear_explicit(&mut self) {
        self.explicit_close = false;
    }

    /// Move to `Connecting` if allowed. No-op while connecting or connected.
    pub fn begin_attempt(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected || self.auth_blocked {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Channel opened. Returns `false` if no attempt was in flight.
    pub fn opened(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.refreshed = false;
        true
    }

    /// Channel closed, errored, or failed to open.
    pub fn failed(&mut self, cause: &CloseCause) -> Recovery {
        self.state = ConnectionState::Disconnected;
        if self.explicit_close {
            return Recovery::Ignore;
        }
        match cause {
            CloseCause::Unauthorized(_) if !self.refreshed => {
                self.refreshed = true;
                Recovery::RefreshCredential
            }
            CloseCause::Unauthorized(_) => {
                self.auth_blocked = true;
                Recovery::Fatal
            }
            CloseCause::Network(_) | CloseCause::Stale => Recovery::Reconnect,
        }
    }

    /// Credential refresh failed; stop until a new credential arrives.
    pub fn refresh_failed(&mut self) {
        self.auth_blocked = true;
    }

    /// A new credential was supplied by the host application.
    pub fn credential_supplied(&mut self) {
        self.auth_blocked = false;
        self.refreshed = false;
    }

    /// Explicit teardown. Returns the state it left.
    pub fn disconnect(&mut self) -> ConnectionState {
        self.explicit_close = true;
        std::mem::replace(&mut self.state, ConnectionState::Disconnected)
    }
}

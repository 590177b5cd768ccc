//! Observable state of the broker connection.
//!
//! The MQTT client reports connects and losses through callbacks on its own
//! thread. Those callbacks only feed a [`ConnectionMonitor`]; everything else
//! reads the state from the monitor or subscribes to its changes.

use core::fmt;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The first connect is in flight.
    Connecting,
    Connected,
    /// The connection dropped and the client library is retrying on its own.
    Reconnecting,
    /// Not connected and nobody is retrying.
    Disconnected,
    /// Closed on purpose during shutdown.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Shared handle on the current [`ConnectionState`].
///
/// Clones observe and update the same state.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        ConnectionMonitor {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Record a new state. Returns the previous one.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(%previous, %next, "connection state changed");
        }
        previous
    }

    /// A receiver that is notified of every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(ConnectionState::Connecting)
    }
}

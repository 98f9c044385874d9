use crate::errors::*;

/// Lifecycle of one physical connection. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Moves to `to`, which must be strictly later in the lifecycle.
    pub(crate) fn advance(&mut self, to: ConnectionState) -> Result<()> {
        if to <= *self {
            return IllegalTransitionSnafu { from: *self, to }.fail();
        }
        *self = to;
        Ok(())
    }

    /// Fails unless the connection is usable for wire operations.
    pub(crate) fn ensure_connected(self) -> Result<()> {
        match self {
            ConnectionState::Connected => Ok(()),
            state => NotConnectedSnafu { state }.fail(),
        }
    }
}

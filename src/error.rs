use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointDescriptor;
use crate::transport::TransportError;

/// Errors surfaced by [crate::channel::channel::Channel]. All variants are cheap to clone so that
///  the terminal cause of a failed channel can be reported to every subsequent caller.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum ChannelError {
    /// Programmer error - retrying the same call will fail the same way
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// The channel was closed explicitly and successfully
    #[error("channel closed")]
    ClosedOk,

    /// The channel was closed because of a failure. This is the signal to stop consuming.
    #[error("channel closed: {cause}")]
    Closed { cause: CloseCause },

    /// An update could not open the new endpoint and no rollback was possible or requested. The
    ///  channel is closed.
    #[error("update to {endpoint} failed: {cause}")]
    UpdateFailed { endpoint: EndpointDescriptor, cause: TransportError },

    /// An update could not open the new endpoint, but the channel was reconnected to its previous
    ///  endpoint and remains usable.
    #[error("update failed ({cause}) - rolled back to {endpoint}")]
    RolledBack { endpoint: EndpointDescriptor, cause: TransportError },

    /// The initial connection attempt failed. There is no retry for the initial open, even with
    ///  reconnect enabled.
    #[error("failed to open channel: {0}")]
    OpenFailed(TransportError),
}

impl ChannelError {
    /// true for the two 'channel is gone' errors that end iteration over a channel
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::ClosedOk | ChannelError::Closed { .. })
    }

    pub fn close_cause(&self) -> Option<&CloseCause> {
        match self {
            ChannelError::Closed { cause } => Some(cause),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum UsageError {
    #[error("cannot call recv while another caller is already waiting for the next message")]
    ConcurrentReceive,
    #[error("cannot update while another update is in progress")]
    ConcurrentUpdate,
    #[error("the channel is closed")]
    Closed,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The root cause behind a channel ending in CLOSED(error)
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum CloseCause {
    #[error("{0}")]
    Transport(TransportError),
    /// Reconnecting did not succeed within the configured dead channel timeout
    #[error("no successful reconnect within {after:?}")]
    WatchdogTimeout { after: Duration },
    /// The task driving the channel terminated unexpectedly
    #[error("channel driver terminated")]
    DriverGone,
}

impl CloseCause {
    pub fn is_watchdog_timeout(&self) -> bool {
        matches!(self, CloseCause::WatchdogTimeout { .. })
    }
}

impl From<TransportError> for CloseCause {
    fn from(value: TransportError) -> Self {
        CloseCause::Transport(value)
    }
}

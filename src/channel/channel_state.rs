use thiserror::Error;
use tokio::time::Instant;

use crate::endpoint::EndpointDescriptor;
use crate::error::{ChannelError, CloseCause};
use crate::transport::TransportError;

/// A channel's lifecycle state. `Closed` is terminal, and it carries the reason why the channel
///  was closed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelState {
    /// There is a live connection, and messages from it are fed into the buffer
    Open,
    /// An explicit close is in progress
    Closing,
    /// There is no connection. This is the state while the reconnect loop is running, and also
    ///  while an update swaps connections.
    Reconnecting,
    Closed(Closure),
}

/// A snapshot of everything observable about a channel, published by the task driving it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// The committed endpoint. During an update, this remains the previous endpoint until the
    ///  update succeeds.
    pub endpoint: EndpointDescriptor,
    /// set while reconnecting with a dead channel timeout
    pub watchdog_deadline: Option<Instant>,
    /// failed reconnect attempts in the current outage
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Closure {
    /// closed explicitly by the application
    Ok,
    Error(CloseCause),
}

/// The events that move a channel through its lifecycle. Whether they are legal depends on the
///  state they are applied to, see [ChannelState::transition].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelTransition {
    /// The connection was lost or the remote side violated the protocol
    Disconnected { cause: TransportError, reconnect: bool },
    /// A connection was (re-)established, either by the reconnect loop or by an update
    Connected,
    /// An update releases the current connection (if any) before connecting to the new endpoint
    UpdateStarted,
    /// Giving up while there is no connection: the watchdog expired, or an update failed and
    ///  could not roll back
    Failed(CloseCause),
    CloseRequested,
    CloseCompleted,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("invalid transition {transition:?} in state {from:?}")]
pub struct InvalidTransition {
    pub from: ChannelState,
    pub transition: ChannelTransition,
}

impl ChannelState {
    /// The pure state machine: the state a transition leads to, without any side effects.
    pub fn transition(&self, transition: ChannelTransition) -> Result<ChannelState, InvalidTransition> {
        use ChannelState::*;
        use ChannelTransition as T;

        let next = match (self, &transition) {
            (Closed(_), _) => None,

            (Open, T::Disconnected { reconnect: true, .. }) => Some(Reconnecting),
            (Open, T::Disconnected { reconnect: false, cause }) => Some(Closed(Closure::Error(CloseCause::Transport(cause.clone())))),

            (Reconnecting, T::Connected) => Some(Open),
            (Reconnecting, T::Failed(cause)) => Some(Closed(Closure::Error(cause.clone()))),

            (Open | Reconnecting, T::UpdateStarted) => Some(Reconnecting),

            (Open | Reconnecting | Closing, T::CloseRequested) => Some(Closing),
            (Closing, T::CloseCompleted) => Some(Closed(Closure::Ok)),

            _ => None,
        };

        next.ok_or_else(|| InvalidTransition {
            from: self.clone(),
            transition,
        })
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, ChannelState::Closing)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ChannelState::Reconnecting)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed(_))
    }

    pub fn close_cause(&self) -> Option<&CloseCause> {
        match self {
            ChannelState::Closed(Closure::Error(cause)) => Some(cause),
            _ => None,
        }
    }

    /// The error a receiver gets once the channel is closed and its buffer is drained, `None` if
    ///  the channel is not closed
    pub fn closed_error(&self) -> Option<ChannelError> {
        match self {
            ChannelState::Closed(Closure::Ok) => Some(ChannelError::ClosedOk),
            ChannelState::Closed(Closure::Error(cause)) => Some(ChannelError::Closed { cause: cause.clone() }),
            _ => None,
        }
    }
}

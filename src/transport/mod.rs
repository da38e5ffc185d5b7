//! The transport is the channel's collaborator for the actual duplex connection. The channel
//!  only needs three things from it: open a connection to an endpoint, pull the next inbound
//!  message, and close. Everything protocol related (framing, handshake, ping / pong) lives
//!  behind this seam.
//!
//! Timeouts are not part of the trait: the channel bounds `open` and `close` with its own
//!  configured timeouts, so implementations can simply await.

pub mod auth;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use thiserror::Error;

use crate::endpoint::EndpointDescriptor;

/// Transport level failures. Connection loss and protocol violations are distinguishable, but the
///  channel treats both as 'disconnected' and leaves it to the reconnect policy what happens next.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("connecting failed: {0}")]
    Connect(String),
    #[error("opening handshake failed: {0}")]
    Handshake(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection closed by remote: {0}")]
    ClosedByRemote(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("received a message of {size} bytes, exceeding the limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
}

impl TransportError {
    /// Protocol violations are the remote side (or a proxy) breaking the rules, as opposed to the
    ///  network going away
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TransportError::Protocol(_) | TransportError::MessageTooLarge { .. })
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// A single open connection. There is no way to restart it - after it fails or is closed, the
///  channel opens a new one through [Transport::open].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportConnection: Send + 'static {
    /// The next inbound message, `Ok(None)` if the remote side closed the connection in an
    ///  orderly fashion.
    ///
    /// This must be cancel safe: the channel drops a pending `recv_next` when it closes the
    ///  connection, and a message must not be lost in that case unless the connection is
    ///  closed anyway.
    async fn recv_next(&mut self) -> Result<Option<Bytes>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

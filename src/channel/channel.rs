use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::channel_driver::{ChannelCommand, ChannelDriver};
use crate::channel::channel_events::{ChannelEvent, ChannelEventNotifier};
use crate::channel::channel_state::{ChannelState, ChannelStatus};
use crate::channel::guard::OperationGuard;
use crate::channel::message_buffer::{message_buffer, MessageReceiver};
use crate::channel::reconnect::open_connection;
use crate::endpoint::EndpointDescriptor;
use crate::error::{ChannelError, CloseCause, UsageError};
use crate::message::ChannelMessage;
use crate::transport::Transport;
use crate::transport::websocket::{WebSocketOptions, WebSocketTransport};

/// A subscription to a streaming endpoint that survives network interruptions (if so configured)
///  and can be redirected to a different endpoint while in use.
///
/// The channel's state is owned by a background task, so all methods take `&self`, and a
///  channel can be shared between tasks (e.g. through an `Arc`) - with the restriction that only
///  one task at a time may wait in [Channel::recv], and only one may run [Channel::update].
///
/// Dropping the channel closes it.
pub struct Channel {
    commands: mpsc::Sender<ChannelCommand>,
    status: watch::Receiver<ChannelStatus>,
    buffer: MessageReceiver,
    events: Arc<ChannelEventNotifier>,
    update_guard: OperationGuard,
}

impl Channel {
    /// Connects to `endpoint`. A failure to connect is reported right away: there is no retry
    ///  for the initial connection, even if the channel is configured to reconnect.
    pub async fn open(endpoint: EndpointDescriptor, transport: Arc<dyn Transport>, config: ChannelConfig) -> Result<Channel, ChannelError> {
        config.validate()
            .map_err(|e| UsageError::InvalidConfig(e.to_string()))?;
        endpoint.validate()
            .map_err(|e| UsageError::InvalidEndpoint(e.to_string()))?;

        debug!(%endpoint, "opening channel");
        let connection = open_connection(transport.as_ref(), &endpoint, config.open_timeout).await
            .map_err(ChannelError::OpenFailed)?;
        info!(%endpoint, "channel open");

        let (buffer_sender, buffer) = message_buffer(config.max_queue);
        let events = Arc::new(ChannelEventNotifier::new());
        let (status_sender, status) = watch::channel(ChannelStatus {
            state: ChannelState::Open,
            endpoint: endpoint.clone(),
            watchdog_deadline: None,
            reconnect_attempts: 0,
        });
        let (commands, command_receiver) = mpsc::channel(16);

        let driver = ChannelDriver::new(
            Arc::new(config),
            transport,
            endpoint,
            connection,
            buffer_sender,
            events.clone(),
            status_sender,
            command_receiver,
        );
        tokio::spawn(driver.run());

        Ok(Channel {
            commands,
            status,
            buffer,
            events,
            update_guard: OperationGuard::new(),
        })
    }

    /// Convenience for opening a channel over a WebSocket
    pub async fn connect(endpoint: EndpointDescriptor, options: WebSocketOptions, config: ChannelConfig) -> Result<Channel, ChannelError> {
        Self::open(endpoint, Arc::new(WebSocketTransport::new(options)), config).await
    }

    /// The next message. Buffered messages are returned regardless of the channel's state, so
    ///  all messages received before the channel closed remain available. Once the channel is
    ///  closed and the buffer is drained, this fails with [ChannelError::ClosedOk] or
    ///  [ChannelError::Closed].
    ///
    /// Only one caller may wait for a message at a time. Dropping the returned future does not
    ///  lose a message.
    pub async fn recv(&self) -> Result<ChannelMessage, ChannelError> {
        let mut buffer = self.buffer.try_lock()
            .ok_or(UsageError::ConcurrentReceive)?;

        match buffer.pop().await {
            Some(msg) => Ok(msg),
            None => Err(self.closed_error()),
        }
    }

    /// The channel's messages as a stream. The stream ends after a regular close, any other
    ///  error is yielded once before the stream ends.
    pub fn messages(&self) -> BoxStream<'_, Result<ChannelMessage, ChannelError>> {
        stream::unfold(false, move |done| async move {
            if done {
                return None;
            }
            match self.recv().await {
                Ok(msg) => Some((Ok(msg), false)),
                Err(ChannelError::ClosedOk) => None,
                Err(e) => Some((Err(e), true)),
            }
        }).boxed()
    }

    /// Switches the channel to a different endpoint. Messages that were buffered before are
    ///  not discarded.
    ///
    /// If connecting to the new endpoint fails and `rollback` is set, the channel reconnects to
    ///  its previous endpoint and this returns [ChannelError::RolledBack]. Without rollback, or if
    ///  the rollback fails as well, the channel is closed and this returns
    ///  [ChannelError::UpdateFailed].
    ///
    /// Dropping the returned future does not abort the update, and other updates are rejected
    ///  until it is finished.
    pub async fn update(&self, endpoint: EndpointDescriptor, rollback: bool) -> Result<(), ChannelError> {
        endpoint.validate()
            .map_err(|e| UsageError::InvalidEndpoint(e.to_string()))?;
        let permit = self.update_guard.try_acquire()
            .ok_or(UsageError::ConcurrentUpdate)?;
        if self.is_closed() {
            return Err(UsageError::Closed.into());
        }

        let (reply, reply_receiver) = oneshot::channel();
        self.commands.send(ChannelCommand::Update { endpoint, rollback, reply, permit }).await
            .map_err(|_| UsageError::Closed)?;

        match reply_receiver.await {
            Ok(result) => result,
            // the driver terminated without processing the update, i.e. the channel was closed
            Err(_) => Err(UsageError::Closed.into()),
        }
    }

    /// Closes the channel, waiting for the connection (if any) to be closed. Messages that are
    ///  already buffered remain available through [Channel::recv].
    ///
    /// Closing a closed channel has no effect.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Ok(());
        }

        let (reply, reply_receiver) = oneshot::channel();
        if self.commands.send(ChannelCommand::Close { reply }).await.is_ok() {
            let _ = reply_receiver.await;
        }
        Ok(())
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// A receiver for status changes, e.g. for waiting until the channel reaches some state
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state.clone()
    }

    pub fn endpoint(&self) -> EndpointDescriptor {
        self.status.borrow().endpoint.clone()
    }

    /// The reason the channel failed, `None` unless it is closed with an error
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.status.borrow().state.close_cause().cloned()
    }

    pub fn is_open(&self) -> bool {
        self.status.borrow().state.is_open()
    }

    pub fn is_closing(&self) -> bool {
        self.status.borrow().state.is_closing()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status.borrow().state.is_reconnecting()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state.is_closed()
    }

    /// number of messages that were received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn closed_error(&self) -> ChannelError {
        self.status.borrow().state.closed_error()
            .unwrap_or(ChannelError::Closed { cause: CloseCause::DriverGone })
    }
}

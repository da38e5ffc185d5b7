use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::channel::message_buffer::MessageSender;
use crate::endpoint::EndpointDescriptor;
use crate::message::ChannelMessage;
use crate::transport::{TransportConnection, TransportError};

/// Closes a connection, giving up after `close_timeout`
pub async fn close_connection(connection: &mut dyn TransportConnection, close_timeout: Duration) {
    match time::timeout(close_timeout, connection.close()).await {
        Ok(Ok(())) => trace!("connection closed"),
        Ok(Err(e)) => debug!("error closing connection: {}", e),
        Err(_) => warn!(?close_timeout, "connection did not close in time - abandoning it"),
    }
}

pub struct FeederConfig {
    pub endpoint: EndpointDescriptor,
    pub max_message_size: Option<usize>,
    pub close_timeout: Duration,
}

/// The task that owns an open connection: it moves every received message into the buffer, and
///  it reports the connection's end through `on_disconnect` - unless the end was requested through
///  [Feeder::shutdown].
///
/// A message that was taken from the connection always ends up in the buffer, even if that
///  exceeds the buffer's bound because the feeder is shut down while waiting for room.
pub struct Feeder {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Feeder {
    pub fn spawn<F>(
        connection: Box<dyn TransportConnection>,
        config: FeederConfig,
        buffer: MessageSender,
        on_disconnect: F,
    ) -> Feeder
    where F: FnOnce(TransportError) + Send + 'static,
    {
        let (shutdown, shutdown_receiver) = oneshot::channel();
        let handle = tokio::spawn(feed(connection, config, buffer, shutdown_receiver, on_disconnect));

        Feeder {
            shutdown: Some(shutdown),
            handle,
        }
    }

    /// Stops feeding and closes the connection in an orderly fashion. The feeder bounds closing
    ///  the connection by its close timeout, `max_wait` is the upper bound for the feeder as a
    ///  whole.
    pub async fn shutdown(mut self, max_wait: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if time::timeout(max_wait, &mut self.handle).await.is_err() {
            warn!("feeder did not terminate in time - aborting it");
            self.handle.abort();
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn feed<F>(
    mut connection: Box<dyn TransportConnection>,
    config: FeederConfig,
    buffer: MessageSender,
    mut shutdown: oneshot::Receiver<()>,
    on_disconnect: F,
)
where F: FnOnce(TransportError) + Send + 'static,
{
    debug!(endpoint = %config.endpoint, "feeding messages from connection");

    loop {
        let received = select! {
            biased;
            _ = &mut shutdown => {
                debug!(endpoint = %config.endpoint, "shutting down connection");
                close_connection(connection.as_mut(), config.close_timeout).await;
                return;
            }
            received = connection.recv_next() => received,
        };

        let payload = match received {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                on_disconnect(TransportError::ClosedByRemote("remote side closed the connection".to_string()));
                return;
            }
            Err(e) => {
                on_disconnect(e);
                return;
            }
        };

        if let Some(limit) = config.max_message_size {
            if payload.len() > limit {
                close_connection(connection.as_mut(), config.close_timeout).await;
                on_disconnect(TransportError::MessageTooLarge { size: payload.len(), limit });
                return;
            }
        }

        let msg = ChannelMessage::new(payload, config.endpoint.clone());

        // a cancelled push leaves the message with us, so it can still be buffered on shutdown
        let pushed = select! {
            biased;
            _ = &mut shutdown => {
                debug!(endpoint = %config.endpoint, "shutting down - buffering the pending message");
                if buffer.push_overflow(msg).is_err() {
                    debug!(endpoint = %config.endpoint, "buffer is closed - discarding pending message");
                }
                close_connection(connection.as_mut(), config.close_timeout).await;
                return;
            }
            pushed = buffer.push(msg.clone()) => pushed,
        };

        if pushed.is_err() {
            debug!(endpoint = %config.endpoint, "buffer is closed - closing connection");
            close_connection(connection.as_mut(), config.close_timeout).await;
            return;
        }
    }
}

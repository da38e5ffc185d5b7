use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, info, warn};

use crate::channel::backoff::ReconnectBackoff;
use crate::channel::channel_config::BackoffConfig;
use crate::endpoint::EndpointDescriptor;
use crate::transport::{Transport, TransportConnection, TransportError};

/// A single connection attempt, bounded by `open_timeout`
pub async fn open_connection(transport: &dyn Transport, endpoint: &EndpointDescriptor, open_timeout: Duration) -> Result<Box<dyn TransportConnection>, TransportError> {
    match time::timeout(open_timeout, transport.open(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(open_timeout)),
    }
}

/// Tries to reopen a connection to a fixed endpoint until it succeeds. There is no limit on the
///  number of attempts: the loop runs until it succeeds or the task running it is aborted.
pub struct ReconnectLoop {
    transport: Arc<dyn Transport>,
    endpoint: EndpointDescriptor,
    open_timeout: Duration,
    backoff: ReconnectBackoff,
}

impl ReconnectLoop {
    pub fn new(transport: Arc<dyn Transport>, endpoint: EndpointDescriptor, open_timeout: Duration, backoff: BackoffConfig) -> ReconnectLoop {
        ReconnectLoop {
            transport,
            endpoint,
            open_timeout,
            backoff: ReconnectBackoff::new(backoff),
        }
    }

    /// `on_failure` is called with the 1-based attempt number for every failed attempt
    pub async fn run<F>(mut self, mut on_failure: F) -> Box<dyn TransportConnection>
    where F: FnMut(u32, TransportError)
    {
        loop {
            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            debug!(endpoint = %self.endpoint, attempt, ?delay, "waiting before reconnect attempt");
            time::sleep(delay).await;

            match open_connection(self.transport.as_ref(), &self.endpoint, self.open_timeout).await {
                Ok(connection) => {
                    info!(endpoint = %self.endpoint, attempt, "reconnected");
                    return connection;
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, attempt, "reconnect attempt failed: {}", e);
                    on_failure(attempt, e);
                }
            }
        }
    }
}

//! Runs a channel in the background, turning its messages into application values.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::channel::channel::Channel;
use crate::endpoint::EndpointDescriptor;
use crate::error::ChannelError;
use crate::message::ChannelMessage;

/// Receives messages from a channel in a background task, passes each through a parser and sends
///  the result to a queue. Messages that fail to parse are logged and skipped.
///
/// Processing ends when the channel closes, or when the queue's receiver is dropped.
pub struct StreamProcessor {
    channel: Arc<Channel>,
    task: Option<JoinHandle<Result<(), ChannelError>>>,
}

impl StreamProcessor {
    pub fn start<T, P>(channel: Channel, mut parser: P, queue: mpsc::Sender<T>) -> StreamProcessor
    where
        T: Send + 'static,
        P: FnMut(&ChannelMessage) -> anyhow::Result<T> + Send + 'static,
    {
        let channel = Arc::new(channel);

        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                let msg = match task_channel.recv().await {
                    Ok(msg) => msg,
                    Err(ChannelError::ClosedOk) => {
                        debug!("channel closed - stream processing finished");
                        return Ok(());
                    }
                    Err(e) => {
                        error!("stream processing terminated: {}", e);
                        return Err(e);
                    }
                };

                let value = match parser(&msg) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(endpoint = %msg.endpoint(), "error processing message {:?} - skipping: {:#}", msg.payload(), e);
                        continue;
                    }
                };

                if queue.send(value).await.is_err() {
                    debug!("stream processor queue was dropped - stopping");
                    return Ok(());
                }
            }
        });

        StreamProcessor {
            channel,
            task: Some(task),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// true until processing ends, either through [StreamProcessor::stop] or because the channel
    ///  closed
    pub fn is_running(&self) -> bool {
        self.task.as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Changes the endpoint without interrupting processing, see [Channel::update]
    pub async fn update(&self, endpoint: EndpointDescriptor, rollback: bool) -> Result<(), ChannelError> {
        self.channel.update(endpoint, rollback).await
    }

    /// Closes the channel and waits for processing to end. Returns the error that ended processing
    ///  prematurely, if any - e.g. the channel failing to reconnect.
    ///
    /// Stopping a stopped processor has no effect.
    pub async fn stop(&mut self) -> Result<(), ChannelError> {
        let task = match self.task.take() {
            Some(task) => task,
            None => return Ok(()),
        };

        self.channel.close().await?;

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

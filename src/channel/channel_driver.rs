use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::channel_events::{ChannelEvent, ChannelEventNotifier, EndpointChangedData, ReconnectAttemptFailedData, StateChangedData};
use crate::channel::channel_state::{ChannelState, ChannelStatus, ChannelTransition, Closure};
use crate::channel::feeder::{close_connection, Feeder, FeederConfig};
use crate::channel::guard::OperationPermit;
use crate::channel::message_buffer::MessageSender;
use crate::channel::reconnect::{open_connection, ReconnectLoop};
use crate::channel::watchdog::Watchdog;
use crate::endpoint::EndpointDescriptor;
use crate::error::{ChannelError, CloseCause, UsageError};
use crate::transport::{Transport, TransportConnection, TransportError};

/// Requests from the [crate::channel::channel::Channel] handle
pub enum ChannelCommand {
    Update {
        endpoint: EndpointDescriptor,
        rollback: bool,
        reply: oneshot::Sender<Result<(), ChannelError>>,
        /// held until the update is finished, even if the caller stops waiting for it
        permit: OperationPermit,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications from the driver's background tasks. Each is tagged with the epoch the task was
///  started in, and it is ignored if the driver has moved on since.
enum DriverEvent {
    Disconnected { epoch: u64, cause: TransportError },
    Reconnected { epoch: u64, connection: Box<dyn TransportConnection> },
    ReconnectAttemptFailed { epoch: u64, attempt: u32, error: TransportError },
    WatchdogExpired { epoch: u64, after: Duration },
}

/// The task owning a channel's state. All state transitions happen here, one at a time: commands
///  from the channel handle and notifications from background tasks are processed in the order
///  they arrive.
pub struct ChannelDriver {
    config: Arc<ChannelConfig>,
    transport: Arc<dyn Transport>,
    /// dropped when the channel is closed, which closes the buffer once the feeder is gone
    buffer: Option<MessageSender>,
    events: Arc<ChannelEventNotifier>,
    status: watch::Sender<ChannelStatus>,

    commands: mpsc::Receiver<ChannelCommand>,
    event_sender: mpsc::UnboundedSender<DriverEvent>,
    event_receiver: mpsc::UnboundedReceiver<DriverEvent>,

    state: ChannelState,
    endpoint: EndpointDescriptor,
    epoch: u64,
    reconnect_attempts: u32,

    feeder: Option<Feeder>,
    reconnect: Option<JoinHandle<()>>,
    watchdog: Option<Watchdog>,
}

impl ChannelDriver {
    /// Creates a driver for a connection that was just opened. The driver starts feeding from the
    ///  connection right away, messages are processed once [ChannelDriver::run] is called.
    pub fn new(
        config: Arc<ChannelConfig>,
        transport: Arc<dyn Transport>,
        endpoint: EndpointDescriptor,
        connection: Box<dyn TransportConnection>,
        buffer: MessageSender,
        events: Arc<ChannelEventNotifier>,
        status: watch::Sender<ChannelStatus>,
        commands: mpsc::Receiver<ChannelCommand>,
    ) -> ChannelDriver {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let mut driver = ChannelDriver {
            config,
            transport,
            buffer: Some(buffer),
            events,
            status,
            commands,
            event_sender,
            event_receiver,
            state: ChannelState::Open,
            endpoint,
            epoch: 0,
            reconnect_attempts: 0,
            feeder: None,
            reconnect: None,
            watchdog: None,
        };
        driver.start_feeder(connection);
        driver.publish();
        driver
    }

    pub async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "starting channel driver");

        while !self.state.is_closed() {
            select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Update { endpoint, rollback, reply, permit }) => {
                        let result = self.on_update(endpoint, rollback).await;
                        // released before replying so that the caller can start the next update
                        //  right away
                        drop(permit);
                        let _ = reply.send(result);
                    }
                    Some(ChannelCommand::Close { reply }) => {
                        self.on_close().await;
                        let _ = reply.send(());
                    }
                    None => {
                        debug!(endpoint = %self.endpoint, "channel handle was dropped - closing");
                        self.on_close().await;
                    }
                },
                Some(evt) = self.event_receiver.recv() => {
                    self.on_event(evt).await;
                }
            }
        }

        // a reconnect that succeeded just before the channel closed may still be in the mailbox
        self.event_receiver.close();
        while let Ok(evt) = self.event_receiver.try_recv() {
            if let DriverEvent::Reconnected { connection, .. } = evt {
                self.discard_connection(connection);
            }
        }

        debug!(endpoint = %self.endpoint, state = ?self.state, "channel driver terminated");
    }

    fn publish(&self) {
        self.status.send_replace(ChannelStatus {
            state: self.state.clone(),
            endpoint: self.endpoint.clone(),
            watchdog_deadline: self.watchdog.as_ref().map(|w| w.deadline()),
            reconnect_attempts: self.reconnect_attempts,
        });
    }

    /// Applies a state transition, starting a new epoch. Background tasks from the previous epoch
    ///  are not stopped here, that is up to the caller.
    fn transition(&mut self, transition: ChannelTransition) -> bool {
        let new_state = match self.state.transition(transition) {
            Ok(s) => s,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };

        self.epoch += 1;
        let old_state = mem::replace(&mut self.state, new_state.clone());
        debug!(endpoint = %self.endpoint, epoch = self.epoch, "state transition {:?} -> {:?}", old_state, new_state);

        if !new_state.is_reconnecting() {
            self.watchdog = None;
            self.reconnect_attempts = 0;
        }

        // the status must show CLOSED before the buffer is closed so that a receiver woken up by
        //  closing the buffer sees why
        self.publish();
        if let ChannelState::Closed(closure) = &new_state {
            if let Closure::Error(cause) = closure {
                error!(endpoint = %self.endpoint, "channel failed: {}", cause);
            }
            self.buffer = None;
        }

        if old_state != new_state {
            self.events.send_event(ChannelEvent::StateChanged(StateChangedData {
                old_state,
                new_state,
            }));
        }
        true
    }

    fn start_feeder(&mut self, connection: Box<dyn TransportConnection>) {
        let buffer = match &self.buffer {
            Some(buffer) => buffer.clone(),
            None => {
                warn!(endpoint = %self.endpoint, "buffer is closed - not feeding from connection");
                self.discard_connection(connection);
                return;
            }
        };
        let epoch = self.epoch;
        let sender = self.event_sender.clone();

        self.feeder = Some(Feeder::spawn(
            connection,
            FeederConfig {
                endpoint: self.endpoint.clone(),
                max_message_size: self.config.max_message_size,
                close_timeout: self.config.close_timeout,
            },
            buffer,
            move |cause| {
                let _ = sender.send(DriverEvent::Disconnected { epoch, cause });
            },
        ));
    }

    async fn shutdown_feeder(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            // the feeder bounds closing the connection by the close timeout, this is the upper
            //  bound for the feeder as a whole
            feeder.shutdown(self.config.close_timeout.saturating_mul(2)).await;
        }
    }

    fn start_reconnecting(&mut self) {
        let epoch = self.epoch;

        if let Some(timeout) = self.config.dead_channel_timeout {
            let sender = self.event_sender.clone();
            self.watchdog = Some(Watchdog::start(timeout, move || {
                let _ = sender.send(DriverEvent::WatchdogExpired { epoch, after: timeout });
            }));
        }

        let reconnect_loop = ReconnectLoop::new(self.transport.clone(), self.endpoint.clone(), self.config.open_timeout, self.config.backoff.clone());
        let sender = self.event_sender.clone();
        self.reconnect = Some(tokio::spawn(async move {
            let failure_sender = sender.clone();
            let connection = reconnect_loop.run(move |attempt, error| {
                let _ = failure_sender.send(DriverEvent::ReconnectAttemptFailed { epoch, attempt, error });
            }).await;
            let _ = sender.send(DriverEvent::Reconnected { epoch, connection });
        }));

        info!(endpoint = %self.endpoint, epoch, dead_channel_timeout = ?self.config.dead_channel_timeout, "connection lost - reconnecting");
        self.publish();
    }

    /// Stops the reconnect loop and the watchdog. A connection that the reconnect loop has opened
    ///  but not yet handed over is dropped.
    fn cancel_background_tasks(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }

    fn discard_connection(&self, mut connection: Box<dyn TransportConnection>) {
        let close_timeout = self.config.close_timeout;
        tokio::spawn(async move {
            close_connection(connection.as_mut(), close_timeout).await;
        });
    }

    async fn on_event(&mut self, evt: DriverEvent) {
        match evt {
            DriverEvent::Disconnected { epoch, cause } if epoch == self.epoch => {
                // the feeder terminated after reporting the disconnect
                self.feeder = None;

                let reconnect = self.config.reconnect;
                warn!(endpoint = %self.endpoint, reconnect, "connection lost: {}", cause);
                if self.transition(ChannelTransition::Disconnected { cause, reconnect }) && reconnect {
                    self.start_reconnecting();
                }
            }
            DriverEvent::Reconnected { epoch, connection } if epoch == self.epoch => {
                self.cancel_background_tasks();
                if self.transition(ChannelTransition::Connected) {
                    self.start_feeder(connection);
                }
                else {
                    self.discard_connection(connection);
                }
            }
            DriverEvent::ReconnectAttemptFailed { epoch, attempt, error } if epoch == self.epoch => {
                self.reconnect_attempts = attempt;
                self.publish();
                self.events.send_event(ChannelEvent::ReconnectAttemptFailed(ReconnectAttemptFailedData {
                    endpoint: self.endpoint.clone(),
                    attempt,
                    error,
                }));
            }
            DriverEvent::WatchdogExpired { epoch, after } if epoch == self.epoch => {
                self.cancel_background_tasks();
                warn!(endpoint = %self.endpoint, ?after, attempts = self.reconnect_attempts, "giving up reconnecting");
                self.transition(ChannelTransition::Failed(CloseCause::WatchdogTimeout { after }));
            }
            DriverEvent::Reconnected { epoch, connection } => {
                debug!(epoch, current_epoch = self.epoch, "discarding connection from a superseded reconnect");
                self.discard_connection(connection);
            }
            _ => {
                trace!(current_epoch = self.epoch, "ignoring stale background notification");
            }
        }
    }

    async fn on_update(&mut self, endpoint: EndpointDescriptor, rollback: bool) -> Result<(), ChannelError> {
        if self.state.is_closed() || self.state.is_closing() {
            return Err(UsageError::Closed.into());
        }

        let previous = self.endpoint.clone();
        info!(from = %previous, to = %endpoint, rollback, "updating channel endpoint");

        self.cancel_background_tasks();
        self.transition(ChannelTransition::UpdateStarted);
        self.shutdown_feeder().await;

        let cause = match open_connection(self.transport.as_ref(), &endpoint, self.config.open_timeout).await {
            Ok(connection) => {
                self.endpoint = endpoint.clone();
                self.events.send_event(ChannelEvent::EndpointChanged(EndpointChangedData {
                    old_endpoint: previous,
                    new_endpoint: endpoint,
                }));
                self.transition(ChannelTransition::Connected);
                self.start_feeder(connection);
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(endpoint = %endpoint, "update failed: {}", cause);
        if !rollback {
            self.transition(ChannelTransition::Failed(cause.clone().into()));
            return Err(ChannelError::UpdateFailed { endpoint, cause });
        }

        match open_connection(self.transport.as_ref(), &previous, self.config.open_timeout).await {
            Ok(connection) => {
                info!(endpoint = %previous, "rolled back to previous endpoint");
                self.transition(ChannelTransition::Connected);
                self.start_feeder(connection);
                Err(ChannelError::RolledBack { endpoint: previous, cause })
            }
            Err(rollback_cause) => {
                warn!(endpoint = %previous, "rollback failed: {}", rollback_cause);
                self.transition(ChannelTransition::Failed(rollback_cause.into()));
                Err(ChannelError::UpdateFailed { endpoint, cause })
            }
        }
    }

    async fn on_close(&mut self) {
        if self.state.is_closed() {
            return;
        }

        self.cancel_background_tasks();
        self.transition(ChannelTransition::CloseRequested);
        self.shutdown_feeder().await;
        self.transition(ChannelTransition::CloseCompleted);
        info!(endpoint = %self.endpoint, "channel closed");
    }
}

impl Drop for ChannelDriver {
    fn drop(&mut self) {
        // the driver task ended without closing the channel, e.g. because it panicked or the
        //  runtime shut down
        if !self.state.is_closed() {
            self.state = ChannelState::Closed(Closure::Error(CloseCause::DriverGone));
            self.publish();
            self.buffer = None;
            self.feeder = None;
        }
    }
}

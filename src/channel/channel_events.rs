use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::channel_state::ChannelState;
use crate::endpoint::EndpointDescriptor;
use crate::transport::TransportError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    StateChanged(StateChangedData),
    /// sent when an update commits a new endpoint - not for a rollback to the previous one
    EndpointChanged(EndpointChangedData),
    ReconnectAttemptFailed(ReconnectAttemptFailedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateChangedData {
    pub old_state: ChannelState,
    pub new_state: ChannelState,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointChangedData {
    pub old_endpoint: EndpointDescriptor,
    pub new_endpoint: EndpointDescriptor,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectAttemptFailedData {
    pub endpoint: EndpointDescriptor,
    /// 1-based, counting from the start of the current outage
    pub attempt: u32,
    pub error: TransportError,
}


pub struct ChannelEventNotifier {
    sender: broadcast::Sender<ChannelEvent>,
}
impl ChannelEventNotifier {
    pub fn new() -> ChannelEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ChannelEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ChannelEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

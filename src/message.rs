use bytes::Bytes;
use serde_json::{json, Value};

use crate::endpoint::EndpointDescriptor;

/// A single inbound message, tagged with the endpoint the channel was subscribed to when the
///  message arrived. Messages buffered before an update keep their old endpoint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelMessage {
    payload: Bytes,
    endpoint: EndpointDescriptor,
}

impl ChannelMessage {
    pub fn new(payload: Bytes, endpoint: EndpointDescriptor) -> ChannelMessage {
        ChannelMessage {
            payload,
            endpoint,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The payload parsed as JSON. Servers occasionally push payloads that are not valid JSON
    ///  (truncated content, plain-text error pages); these are wrapped in an object with an
    ///  `Errors` entry and the raw text as `ResponseContent` rather than failing.
    pub fn content(&self) -> Value {
        match serde_json::from_slice(&self.payload) {
            Ok(value) => value,
            Err(_) => json!({
                "Errors": ["Unable to parse response content"],
                "ResponseContent": String::from_utf8_lossy(&self.payload),
            }),
        }
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

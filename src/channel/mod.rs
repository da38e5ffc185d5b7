//! The channel is a long-lived subscription to a streaming endpoint. It keeps a connection
//!  open, buffers what arrives, and (if configured) reconnects after connection loss until a
//!  watchdog decides that the remote side has been gone for too long.
//!
//! [channel::Channel] is the handle applications use. Its state lives in a
//!  [channel_driver::ChannelDriver] task which serializes all transitions, with background tasks
//!  for reading from the connection ([feeder]), reconnecting ([reconnect]) and timing out
//!  ([watchdog]).

pub mod backoff;
pub mod channel;
pub mod channel_config;
pub mod channel_driver;
pub mod channel_events;
pub mod channel_state;
pub mod feeder;
pub mod guard;
pub mod message_buffer;
pub mod reconnect;
pub mod watchdog;

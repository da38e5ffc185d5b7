pub mod channel;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod stream_processor;
pub mod test_util;
pub mod transport;
pub mod util;

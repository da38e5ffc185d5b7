//! This module contains utilities for testing code that uses channels without a network: a
//!  transport whose connection attempts follow a script, and whose connections are fed by the
//!  test. They are used for testing the channel itself, but they are also exported for
//!  application testing.

pub mod transport;

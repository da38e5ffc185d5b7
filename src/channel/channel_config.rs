use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// If true, the channel tries to reconnect after an unexpected disconnect. If false, losing
    ///  the connection closes the channel with an error.
    pub reconnect: bool,

    /// Maximum time the channel may spend reconnecting before it gives up and closes with
    ///  [crate::error::CloseCause::WatchdogTimeout]. `None` means reconnecting forever.
    ///
    /// Only relevant with `reconnect == true`.
    pub dead_channel_timeout: Option<Duration>,

    /// Upper bound for opening a connection, including the opening handshake. This applies to the
    ///  initial open, every reconnect attempt and the connection attempts of an update.
    pub open_timeout: Duration,

    /// Upper bound for an orderly shutdown of a connection - after that, the connection is
    ///  abandoned
    pub close_timeout: Duration,

    /// Inbound messages larger than this are treated as a protocol violation, i.e. like a
    ///  disconnect. `None` for no limit.
    pub max_message_size: Option<usize>,

    /// Maximum number of received messages that are buffered without being consumed. When the
    ///  buffer is full, the channel stops reading from the connection until a message is
    ///  consumed. `None` for an unbounded buffer.
    pub max_queue: Option<usize>,

    pub backoff: BackoffConfig,
}

impl ChannelConfig {
    pub fn new() -> ChannelConfig {
        ChannelConfig {
            reconnect: false,
            dead_channel_timeout: Some(Duration::from_secs(3600)),
            open_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            max_message_size: Some(1 << 20),
            max_queue: Some(32),
            backoff: BackoffConfig::default(),
        }
    }

    /// convenience for the typical 'stay connected' setup
    pub fn reconnecting(dead_channel_timeout: Option<Duration>) -> ChannelConfig {
        ChannelConfig {
            reconnect: true,
            dead_channel_timeout,
            ..ChannelConfig::new()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.open_timeout.is_zero() {
            bail!("open timeout must be positive");
        }
        if self.close_timeout.is_zero() {
            bail!("close timeout must be positive");
        }
        if self.dead_channel_timeout == Some(Duration::ZERO) {
            bail!("dead channel timeout must be positive - use None to disable the watchdog");
        }
        if self.max_queue == Some(0) {
            bail!("max queue must be at least 1 - use None for an unbounded buffer");
        }
        if self.max_message_size == Some(0) {
            bail!("max message size must be positive");
        }
        self.backoff.validate()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::new()
    }
}

/// Delays between reconnect attempts: the first attempt is delayed by a random amount up to
///  `initial_jitter` to avoid many clients hammering a server that just came back, later
///  attempts back off exponentially.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_jitter: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// >= 1.0
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_jitter: Duration::from_secs(5),
            min_delay: Duration::from_millis(1920),
            max_delay: Duration::from_secs(60),
            factor: 1.618,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay.is_zero() {
            bail!("minimum reconnect delay must be positive");
        }
        if self.max_delay < self.min_delay {
            bail!("maximum reconnect delay {:?} is smaller than the minimum {:?}", self.max_delay, self.min_delay);
        }
        if !(self.factor >= 1.0) || !self.factor.is_finite() {
            bail!("backoff factor must be a finite number >= 1.0, was {}", self.factor);
        }
        Ok(())
    }
}

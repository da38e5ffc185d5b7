use std::marker::PhantomData;
use std::time::Duration;

use crate::channel::channel_config::BackoffConfig;
use crate::util::random::{Random, RngRandom};

/// Delays between the attempts of one reconnect loop. A new loop (i.e. a new outage) starts with
///  a fresh instance.
pub struct ReconnectBackoff<R: Random = RngRandom> {
    config: BackoffConfig,
    attempt: u32,
    _random: PhantomData<R>,
}

impl ReconnectBackoff<RngRandom> {
    pub fn new(config: BackoffConfig) -> ReconnectBackoff<RngRandom> {
        Self::new_with_random(config)
    }
}

impl <R: Random> ReconnectBackoff<R> {
    pub fn new_with_random(config: BackoffConfig) -> ReconnectBackoff<R> {
        ReconnectBackoff {
            config,
            attempt: 0,
            _random: Default::default(),
        }
    }

    /// number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next attempt. The first one is random in `[0, initial_jitter)`, after
    ///  that the delay grows exponentially from `min_delay` up to `max_delay`.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        if self.attempt == 1 {
            return self.config.initial_jitter.mul_f64(R::unit_f64());
        }

        let exponent = (self.attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.config.min_delay.as_secs_f64() * self.config.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs).max(self.config.min_delay)
    }
}

use rand::Rng;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for backoff jitter, abstracted so that tests can make delays predictable
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// uniformly distributed in `[0.0, 1.0)`
    fn unit_f64() -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn unit_f64() -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

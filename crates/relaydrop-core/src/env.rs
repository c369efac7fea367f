//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). The
//! relay and the client state machines take an `Environment` so that the
//! simulation harness can drive them with a virtual clock and a seeded RNG,
//! while production runs on [`crate::SystemEnv`].

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` is seeded (reproducible) in simulation and uses OS
///   entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`, simulation uses virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only runtime code awaits this; state machines take `now` as input.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for session ids, participant ids and request ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random non-zero `u64`.
    ///
    /// Zero is reserved on the wire ("no recipient"), so identifiers use this.
    fn random_id(&self) -> u64 {
        loop {
            let id = self.random_u64();
            if id != 0 {
                return id;
            }
        }
    }
}

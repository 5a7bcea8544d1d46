//! Mock implementations for testing.
//!
//! Provides deterministic, reproducible randomness and time for automated tests.

use crate::traits::{Clock, SecureRandom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Deterministic random source.
///
/// Produces a fixed byte stream from a 64-bit seed (SplitMix64). Two instances
/// built from the same seed yield identical output.
///
/// # Example
///
/// ```
/// use kiln_platform::mock::MockRandom;
/// use kiln_platform::SecureRandom;
///
/// let mut a = MockRandom::new(7);
/// let mut b = MockRandom::new(7);
/// let (mut x, mut y) = ([0u8; 16], [0u8; 16]);
/// a.fill_bytes(&mut x);
/// b.fill_bytes(&mut y);
/// assert_eq!(x, y); // Deterministic
/// ```
#[derive(Debug, Clone)]
pub struct MockRandom {
    state: u64,
}

impl MockRandom {
    /// Creates a generator from `seed`.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl SecureRandom for MockRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Random source that returns a constant byte.
///
/// Useful when a test needs to predict padding or cookie contents exactly.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub u8);

impl SecureRandom for FixedRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(self.0);
    }
}

/// Settable clock.
///
/// Clones share the same time value, so a test can keep one handle and
/// advance the clock seen by a state machine that owns another.
///
/// # Example
///
/// ```
/// use kiln_platform::mock::MockClock;
/// use kiln_platform::Clock;
///
/// let clock = MockClock::new(100);
/// let handle = clock.clone();
/// handle.advance(50);
/// assert_eq!(clock.now_secs(), 150);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    /// Creates a clock reading `start` seconds.
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_random_deterministic() {
        let mut a = MockRandom::new(42);
        let mut b = MockRandom::new(42);
        let mut x = [0u8; 37];
        let mut y = [0u8; 37];
        a.fill_bytes(&mut x);
        b.fill_bytes(&mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn test_mock_random_seeds_differ() {
        let mut a = MockRandom::new(1);
        let mut b = MockRandom::new(2);
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        a.fill_bytes(&mut x);
        b.fill_bytes(&mut y);
        assert_ne!(x, y);
    }

    #[test]
    fn test_mock_random_advances() {
        let mut rng = MockRandom::new(9);
        let mut x = [0u8; 8];
        let mut y = [0u8; 8];
        rng.fill_bytes(&mut x);
        rng.fill_bytes(&mut y);
        assert_ne!(x, y);
    }

    #[test]
    fn test_fixed_random() {
        let mut rng = FixedRandom(0xAB);
        let mut buf = [0u8; 5];
        rng.fill_bytes(&mut buf);
        assert_eq!(buf, [0xAB; 5]);
    }

    #[test]
    fn test_mock_clock_shared() {
        let clock = MockClock::new(10);
        let other = clock.clone();
        other.set(500);
        assert_eq!(clock.now_secs(), 500);
        clock.advance(5);
        assert_eq!(other.now_secs(), 505);
    }
}

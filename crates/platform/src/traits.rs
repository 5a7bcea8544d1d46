//! Environment traits injected into Kiln protocol state machines.
//!
//! Protocol code never reaches for global randomness or wall-clock time directly.
//! Both are supplied at construction time so tests can substitute the
//! deterministic implementations in [`crate::mock`].

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of cryptographically secure random bytes.
///
/// Used for KEXINIT cookies, packet padding and Diffie-Hellman exponents.
pub trait SecureRandom: Send {
    /// Fill `dest` entirely with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// Source of the current time, in whole seconds.
///
/// The value only needs to be monotonic enough to measure rekey intervals.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary, fixed epoch.
    fn now_secs(&self) -> u64;
}

/// Operating-system random source backed by `ring`.
pub struct OsRandom {
    rng: ring::rand::SystemRandom,
}

impl OsRandom {
    /// Creates a new OS random source.
    pub fn new() -> Self {
        Self {
            rng: ring::rand::SystemRandom::new(),
        }
    }
}

impl Default for OsRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureRandom for OsRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if ring::rand::SecureRandom::fill(&self.rng, dest).is_err() {
            rand::rngs::OsRng.fill_bytes(dest);
        }
    }
}

impl std::fmt::Debug for OsRandom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsRandom").finish_non_exhaustive()
    }
}

/// Wall-clock time from [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_random_fills_buffer() {
        let mut rng = OsRandom::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        rng.fill_bytes(&mut a);
        rng.fill_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }
}

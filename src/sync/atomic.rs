/*
 * Atomic Counters
 *
 * Small wrappers used for id issue and reference counting. Thread ids must
 * be globally unique and monotonically issued across all CPUs, which a
 * single fetch_add provides.
 */

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Monotonic id source.
pub struct IdCounter(AtomicU32);

impl IdCounter {
    pub const fn new(first: u32) -> Self {
        Self(AtomicU32::new(first))
    }

    /// Issue the next id. Never returns the same value twice.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Signed counter with a compare-and-decrement reservation primitive.
pub struct ReserveCounter(AtomicI32);

impl ReserveCounter {
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub fn add(&self, n: i32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract `n` if and only if the counter stays non-negative.
    ///
    /// Returns false without modifying the counter when fewer than `n`
    /// units remain.
    pub fn try_sub(&self, n: i32) -> bool {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur < n {
                return false;
            }
            match self.0.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_counter_monotonic() {
        let c = IdCounter::new(5);
        assert_eq!(c.next(), 5);
        assert_eq!(c.next(), 6);
        assert_eq!(c.next(), 7);
    }

    #[test]
    fn test_reserve_counter_refuses_overdraw() {
        let c = ReserveCounter::new();
        c.add(3);
        assert!(c.try_sub(2));
        assert!(!c.try_sub(2));
        assert_eq!(c.get(), 1);
        assert!(c.try_sub(1));
        assert_eq!(c.get(), 0);
    }
}

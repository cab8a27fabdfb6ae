//! Transaction identifier generation.

use std::sync::atomic::{AtomicU16, Ordering};

/// Issues non-zero, increasing, wrapping 16-bit transaction ids.
///
/// The counter is atomic so one generator can be shared through an
/// [`Arc`](std::sync::Arc) by several links that need ids unique across
/// all of them.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    seed: u16,
    current: AtomicU16,
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TransactionIdGenerator {
    /// Create a generator whose first id is `seed` (0 is promoted to 1).
    #[must_use]
    pub fn new(seed: u16) -> Self {
        let seed = seed.max(1);
        Self {
            seed,
            current: AtomicU16::new(seed),
        }
    }

    /// Return the current id and advance. `0xFFFF` is followed by `1`.
    pub fn next(&self) -> u16 {
        let advanced = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == u16::MAX { 1 } else { id + 1 })
            });
        match advanced {
            Ok(id) | Err(id) => id,
        }
    }

    /// The id the next call to [`next`](Self::next) will return.
    #[must_use]
    pub fn peek(&self) -> u16 {
        self.current.load(Ordering::Relaxed)
    }

    /// Restore the initial seed.
    pub fn reset(&self) {
        self.current.store(self.seed, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ids_increase_from_seed() {
        let ids = TransactionIdGenerator::default();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_zero_seed_promoted() {
        let ids = TransactionIdGenerator::new(0);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn test_wraps_to_one_never_zero() {
        let ids = TransactionIdGenerator::new(0xFFFE);
        assert_eq!(ids.next(), 0xFFFE);
        assert_eq!(ids.next(), 0xFFFF);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_full_cycle_never_issues_zero() {
        let ids = TransactionIdGenerator::default();
        let mut previous = 0u16;
        for _ in 0..(u32::from(u16::MAX) * 2) {
            let id = ids.next();
            assert_ne!(id, 0);
            assert!(id > previous || (previous == u16::MAX && id == 1));
            previous = id;
        }
    }

    #[test]
    fn test_reset() {
        let ids = TransactionIdGenerator::new(10);
        ids.next();
        ids.next();
        ids.reset();
        assert_eq!(ids.peek(), 10);
    }

    #[test]
    fn test_shared_across_threads_unique() {
        let ids = Arc::new(TransactionIdGenerator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}

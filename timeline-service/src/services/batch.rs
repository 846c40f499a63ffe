use crate::models::BatchId;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Mints batch identifiers from wall-clock milliseconds.
///
/// Ids are strictly increasing within one generator: when the clock has not
/// moved past the previous id (same tick, or stepped backwards) the next id
/// is `previous + 1ms`.
#[derive(Debug, Default)]
pub struct BatchIdGenerator {
    last: AtomicI64,
}

impl BatchIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> BatchId {
        self.next_at(Utc::now().timestamp_millis())
    }

    fn next_at(&self, now_millis: i64) -> BatchId {
        let mut previous = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now_millis.max(previous + 1);
            match self.last.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return BatchId::from_millis(candidate),
                Err(actual) => previous = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_same_tick_bumps_by_one_millisecond() {
        let generator = BatchIdGenerator::new();
        let first = generator.next_at(1_000);
        let second = generator.next_at(1_000);
        assert_eq!(first.timestamp_millis(), 1_000);
        assert_eq!(second.timestamp_millis(), 1_001);
    }

    #[test]
    fn test_clock_step_back_stays_monotonic() {
        let generator = BatchIdGenerator::new();
        let first = generator.next_at(5_000);
        let second = generator.next_at(4_000);
        assert!(second > first);
    }

    #[test]
    fn test_tracks_wall_clock() {
        let generator = BatchIdGenerator::new();
        let before = Utc::now().timestamp_millis();
        let id = generator.next();
        assert!(id.timestamp_millis() >= before);
    }

    #[test]
    fn test_unique_across_threads() {
        let generator = Arc::new(BatchIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || (0..250).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1_000);
    }
}

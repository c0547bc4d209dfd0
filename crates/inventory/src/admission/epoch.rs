use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use common::Clock;

use super::Epoch;

/// Mints time-derived, strictly increasing epoch ids.
///
/// An epoch is the current time in milliseconds, bumped past both the last
/// epoch this minter produced and the epoch it replaces, so a stalled or
/// skewed clock can never reuse an id.
pub struct EpochMinter {
    last: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl EpochMinter {
    /// Creates a minter reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last: AtomicI64::new(0),
            clock,
        }
    }

    /// Returns an epoch greater than `previous` and every epoch minted before.
    pub fn mint(&self, previous: Option<Epoch>) -> Epoch {
        let floor = previous.map_or(0, |e| e.get() + 1);
        let now = self.clock.now().timestamp_millis();
        let candidate = now.max(floor);

        let last = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        Epoch::new(candidate.max(last + 1))
    }
}

impl std::fmt::Debug for EpochMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochMinter")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;

    #[test]
    fn epochs_are_time_derived() {
        let clock = ManualClock::starting_now();
        let minter = EpochMinter::new(Arc::new(clock.clone()));
        assert_eq!(minter.mint(None).get(), clock.now().timestamp_millis());
    }

    #[test]
    fn epochs_increase_under_frozen_clock() {
        let minter = EpochMinter::new(Arc::new(ManualClock::starting_now()));
        let first = minter.mint(None);
        let second = minter.mint(None);
        assert!(second > first);
    }

    #[test]
    fn epoch_exceeds_the_one_it_replaces() {
        let clock = ManualClock::starting_now();
        let minter = EpochMinter::new(Arc::new(clock.clone()));
        let ahead = Epoch::new(clock.now().timestamp_millis() + 60_000);
        assert!(minter.mint(Some(ahead)) > ahead);
    }
}

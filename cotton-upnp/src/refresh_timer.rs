use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Shortest refresh interval, as a percentage of the expiry window
const MIN_PERCENT: u32 = 25;

/// Longest refresh interval, as a percentage of the expiry window
const MAX_PERCENT: u32 = 45;

/// Encapsulating the SSDP retransmit process
///
/// Announcements expire after their `max-age`, so they must be
/// repeated well before then. Each interval is drawn afresh between
/// 25% and 45% of the expiry window, so that many devices started
/// together drift apart instead of announcing in lock-step.
///
pub struct RefreshTimer {
    window: Duration,
    next_salvo: Instant,
    rng: StdRng,
}

impl RefreshTimer {
    /// Create a new [`RefreshTimer`], due immediately
    ///
    #[must_use]
    pub fn new(window: Duration, random_seed: u64, now: Instant) -> Self {
        Self {
            window,
            next_salvo: now,
            rng: StdRng::seed_from_u64(random_seed),
        }
    }

    /// Reset the refresh timer (e.g. if network has gone away and come back)
    pub fn reset(&mut self, now: Instant) {
        self.next_salvo = now;
    }

    /// When the next refresh is needed
    #[must_use]
    pub fn next_refresh(&self) -> Instant {
        self.next_salvo
    }

    /// Is a refresh due at `now`?
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_salvo
    }

    /// Update the refresh timer
    ///
    /// Does nothing unless the timer is due; otherwise picks the next
    /// interval. The desired timeout can be obtained from
    /// [`RefreshTimer::next_refresh`].
    ///
    pub fn update_refresh(&mut self, now: Instant) {
        if now < self.next_salvo {
            return;
        }
        let percent = self.rng.random_range(MIN_PERCENT..=MAX_PERCENT);
        self.next_salvo = now + self.window * percent / 100;
    }
}

use crate::{Error, Tripped};

/// Number of consecutive link failures after which polling stops.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Counts consecutive link level failures. Any success resets the count.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        log::debug!(
            "Link failure {} of {}",
            self.consecutive,
            self.threshold
        );
        self.consecutive
    }

    pub fn record_success(&mut self) {
        if self.consecutive > 0 {
            log::trace!("Link recovered after {} failures", self.consecutive);
        }
        self.consecutive = 0;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    /// `Err(Error::BreakerTripped)` once the threshold has been reached.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_tripped() {
            return Err(Error::BreakerTripped(Tripped {
                failures: self.consecutive,
                threshold: self.threshold,
            }));
        }
        Ok(())
    }
}

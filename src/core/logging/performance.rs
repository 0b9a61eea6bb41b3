//! Operation timing against fixed targets.

use std::time::Instant;

use log::{debug, warn};

/// Wall-clock timer for one named operation measured against a target
/// duration.
pub struct OpTimer {
    started: Instant,
    operation: &'static str,
}

impl OpTimer {
    pub fn start(operation: &'static str) -> Self {
        OpTimer {
            started: Instant::now(),
            operation,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Log the outcome against `target_ms` and return the elapsed time.
    /// Overruns warn so slow block handling is visible to operators.
    pub fn finish(self, target_ms: u64) -> u64 {
        let elapsed = self.elapsed_ms();
        if elapsed > target_ms {
            warn!(
                "{} took {}ms (target {}ms)",
                self.operation, elapsed, target_ms
            );
        } else {
            debug!("{} finished in {}ms", self.operation, elapsed);
        }
        elapsed
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use plhub_storage::StoreError;

/// Run-scoped stop signals shared by the pipeline, its writers and the CLI.
///
/// Cancellation is run-granular: once requested no new writes are issued and
/// committed writes stay. A store outage is declared after `outage_threshold`
/// consecutive writes failed with exhausted transient errors.
#[derive(Debug)]
pub struct RunControl {
    cancelled: AtomicBool,
    consecutive_exhausted: AtomicUsize,
    outage_threshold: usize,
}

impl RunControl {
    pub fn new(outage_threshold: usize) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            consecutive_exhausted: AtomicUsize::new(0),
            outage_threshold: outage_threshold.max(1),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn record<T>(&self, result: &Result<T, StoreError>) {
        self.record_write(matches!(result, Err(err) if err.is_exhausted_transient()));
    }

    /// Counts one finished write; any write that did not exhaust its retries ends the streak.
    pub fn record_write(&self, exhausted: bool) {
        if exhausted {
            self.consecutive_exhausted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.consecutive_exhausted.store(0, Ordering::SeqCst);
        }
    }

    pub fn consecutive_exhausted(&self) -> usize {
        self.consecutive_exhausted.load(Ordering::SeqCst)
    }

    pub fn outage(&self) -> bool {
        self.consecutive_exhausted() >= self.outage_threshold
    }

    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.outage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn exhausted() -> Result<(), StoreError> {
        Err(StoreError::Exhausted {
            attempts: 3,
            last: Box::new(StoreError::Timeout {
                op: "upsert".into(),
                after: Duration::from_secs(1),
            }),
        })
    }

    #[test]
    fn outage_needs_consecutive_failures() {
        let control = RunControl::new(2);
        control.record(&exhausted());
        control.record(&Ok(()));
        control.record(&exhausted());
        assert!(!control.outage());
        control.record(&exhausted());
        assert!(control.outage());
        assert!(control.should_stop());
    }

    #[test]
    fn terminal_errors_reset_the_streak() {
        let control = RunControl::new(2);
        control.record(&exhausted());
        control.record::<()>(&Err(StoreError::Rejected("check".into())));
        control.record(&exhausted());
        assert!(!control.outage());
    }
}

//! Admission control with scoped release.
//!
//! [`LoadShedder::try_admit`] performs check-and-increment as one atomic step
//! and hands back an [`AdmissionPermit`]. The slot is released when the permit
//! is dropped, so every exit path (success, error, timeout, cancellation of
//! the owning future, panic unwinding) gives it back exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Overloaded;

/// Process-wide concurrency ceiling shared by every request in its pool.
#[derive(Debug)]
pub struct LoadShedder {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    limit: usize,
    retry_after: Duration,
}

impl LoadShedder {
    /// Creates a shedder admitting at most `limit` concurrent requests.
    /// Rejections suggest `retry_after` as the client back-off.
    #[must_use]
    pub fn new(limit: usize, retry_after: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
            retry_after,
        }
    }

    /// Admits the caller if fewer than `limit` requests are in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Overloaded`] with the configured retry-after hint when the
    /// ceiling is reached. Nothing is incremented on rejection.
    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionPermit, Overloaded> {
        let limit = self.limit;
        match self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            }) {
            Ok(previous) => {
                self.peak.fetch_max(previous + 1, Ordering::Relaxed);
                Ok(AdmissionPermit {
                    shedder: Arc::clone(self),
                })
            }
            Err(current) => Err(Overloaded {
                retry_after: self.retry_after,
                in_flight: current,
                limit,
            }),
        }
    }

    /// Requests currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed since creation.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    fn release(&self) {
        // A permit exists for every increment, so this never underflows; the
        // checked form keeps the counter at zero rather than wrapping if that
        // ever stops being true.
        let released = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        if released.is_err() {
            tracing::error!("load shedder released with no request in flight");
        }
    }
}

/// A held admission slot. Dropping it releases the slot.
#[must_use = "dropping the permit releases the admission slot immediately"]
#[derive(Debug)]
pub struct AdmissionPermit {
    shedder: Arc<LoadShedder>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.shedder.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shedder(limit: usize) -> Arc<LoadShedder> {
        Arc::new(LoadShedder::new(limit, Duration::from_secs(1)))
    }

    #[test]
    fn eleventh_admission_is_rejected_until_one_releases() {
        let shedder = shedder(10);
        let mut permits: Vec<_> = (0..10).map(|_| shedder.try_admit().unwrap()).collect();
        assert_eq!(shedder.in_flight(), 10);

        let rejected = shedder.try_admit().unwrap_err();
        assert_eq!(rejected.in_flight, 10);
        assert_eq!(rejected.limit, 10);
        assert_eq!(rejected.retry_after, Duration::from_secs(1));
        assert_eq!(shedder.in_flight(), 10);

        permits.pop();
        assert_eq!(shedder.in_flight(), 9);
        let _again = shedder.try_admit().unwrap();
        assert_eq!(shedder.in_flight(), 10);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let shedder = shedder(2);
        {
            let _a = shedder.try_admit().unwrap();
            let _b = shedder.try_admit().unwrap();
            assert_eq!(shedder.in_flight(), 2);
        }
        assert_eq!(shedder.in_flight(), 0);
        assert_eq!(shedder.peak(), 2);
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let shedder = shedder(0);
        assert!(shedder.try_admit().is_err());
        assert_eq!(shedder.in_flight(), 0);
    }

    #[test]
    fn panic_while_holding_permit_releases() {
        let shedder = shedder(1);
        let inner = Arc::clone(&shedder);
        let result = std::panic::catch_unwind(move || {
            let _permit = inner.try_admit().unwrap();
            panic!("handler fault");
        });
        assert!(result.is_err());
        assert_eq!(shedder.in_flight(), 0);
    }

    #[tokio::test]
    async fn aborted_task_releases_its_permit() {
        let shedder = shedder(1);
        let permit = shedder.try_admit().unwrap();
        let task = tokio::spawn(async move {
            let _held = permit;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        assert_eq!(shedder.in_flight(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(shedder.in_flight(), 0);
    }
}

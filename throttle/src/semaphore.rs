use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-size pool of stream permits.
#[derive(Debug)]
pub struct StreamLimit {
    cap: usize,
    sem: std::sync::Arc<tokio::sync::Semaphore>,
    peak: AtomicUsize,
}

/// One held stream. Dropping it returns the stream to its [`StreamLimit`].
#[derive(Debug)]
pub struct StreamPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl StreamLimit {
    pub fn new(cap: usize) -> Self {
        let sem = std::sync::Arc::new(tokio::sync::Semaphore::new(cap));
        Self {
            cap,
            sem,
            peak: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of permits that can be acquired right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Number of permits currently held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.cap - self.available()
    }

    /// Highest number of permits held at any one time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Takes a permit if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<StreamPermit> {
        let permit = self.sem.clone().try_acquire_owned().ok()?;
        self.peak.fetch_max(self.held(), Ordering::AcqRel);
        tracing::trace!("stream permit acquired, held: {}/{}", self.held(), self.cap);
        Some(StreamPermit { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_cap() {
        let limit = StreamLimit::new(3);
        let permits: Vec<_> = (0..10).filter_map(|_| limit.try_acquire()).collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(limit.available(), 0);
        assert_eq!(limit.held(), 3);
    }

    #[test]
    fn drop_returns_permit() {
        let limit = StreamLimit::new(1);
        let permit = limit.try_acquire();
        assert!(permit.is_some());
        assert!(limit.try_acquire().is_none());
        drop(permit);
        assert_eq!(limit.available(), 1);
        assert!(limit.try_acquire().is_some());
    }

    #[test]
    fn peak_is_sticky() {
        let limit = StreamLimit::new(4);
        {
            let _a = limit.try_acquire();
            let _b = limit.try_acquire();
        }
        let _c = limit.try_acquire();
        assert_eq!(limit.held(), 1);
        assert_eq!(limit.peak(), 2);
    }

    #[tokio::test]
    async fn permits_move_across_tasks() {
        let limit = std::sync::Arc::new(StreamLimit::new(2));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..2 {
            let permit = limit.try_acquire();
            assert!(permit.is_some());
            join_set.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                drop(permit);
            });
        }
        assert_eq!(limit.available(), 0);
        while let Some(res) = join_set.join_next().await {
            res.unwrap();
        }
        assert_eq!(limit.available(), 2);
    }
}

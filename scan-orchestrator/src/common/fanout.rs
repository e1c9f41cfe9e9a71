//! Bounded concurrent fan-out with error collection.
//!
//! Every item runs as its own task; at most `limit` run at the same time.
//! All tasks run to completion even when some fail, and successful tasks are
//! never rolled back.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{Error, Result};

/// Default maximum number of concurrent fan-out tasks.
pub const DEFAULT_MAX_FANOUT: usize = 64;

/// Outcome of a fan-out.
#[derive(Debug, Default)]
pub struct FanOutReport<O> {
    pub total: usize,
    pub succeeded: Vec<O>,
    pub errors: Vec<Error>,
}

impl<O> FanOutReport<O> {
    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    /// Converts the report into an aggregate error when any task failed.
    pub fn into_result(self, action: &'static str, kind: &'static str) -> Result<Vec<O>> {
        let failed = self.errors.len();
        match self.errors.into_iter().next() {
            None => Ok(self.succeeded),
            Some(first) => Err(Error::FanOut {
                action,
                kind,
                failed,
                total: self.total,
                first: Box::new(first),
            }),
        }
    }
}

/// Runs `op` for every item with at most `limit` tasks in flight.
pub async fn fan_out<I, F, Fut, O>(items: I, limit: usize, op: F) -> FanOutReport<O>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let mut total = 0;

    for item in items {
        total += 1;
        let semaphore = semaphore.clone();
        let task = op(item);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Other(format!("fan-out semaphore closed: {e}")))?;
            task.await
        });
    }

    let mut report = FanOutReport {
        total,
        succeeded: Vec::with_capacity(total),
        errors: Vec::new(),
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(output)) => report.succeeded.push(output),
            Ok(Err(e)) => report.errors.push(e),
            Err(e) => report.errors.push(Error::Other(format!("fan-out task failed: {e}"))),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_collects_errors_without_stopping_siblings() {
        let report = fan_out(0..10u32, 3, |i| async move {
            if i % 4 == 0 {
                Err(Error::Other(format!("item {i}")))
            } else {
                Ok(i)
            }
        })
        .await;

        assert_eq!(report.total, 10);
        assert_eq!(report.failed(), 3);
        let mut succeeded = report.succeeded.clone();
        succeeded.sort_unstable();
        assert_eq!(succeeded, vec![1, 2, 3, 5, 6, 7, 9]);

        let err = report.into_result("create", "AssetScan").unwrap_err();
        assert!(err.to_string().starts_with("Failed to create 3 of 10 AssetScan(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = fan_out(0..20, 4, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(report.failed(), 0);
        assert_eq!(report.succeeded.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let report = fan_out(Vec::<u32>::new(), 8, |i| async move { Ok(i) }).await;
        assert_eq!(report.total, 0);
        assert!(report.into_result("patch", "AssetScan").unwrap().is_empty());
    }
}

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Queue, ReconcileEvent};
use crate::Result;

/// Lists the entities that currently need reconciling.
#[async_trait]
pub trait Discover<T: ReconcileEvent>: Send + Sync + 'static {
    async fn get_items(&self) -> Result<Vec<T>>;
}

/// Periodically discovers items and enqueues them.
///
/// Every cycle takes exactly one poll period: discovery runs under a timeout of
/// one period and the poller then sleeps until the period has elapsed.
pub struct Poller<T, D> {
    poll_period: Duration,
    queue: Queue<T>,
    discover: Arc<D>,
    _event: PhantomData<fn() -> T>,
}

impl<T, D> Poller<T, D>
where
    T: ReconcileEvent,
    D: Discover<T>,
{
    pub fn new(poll_period: Duration, queue: Queue<T>, discover: Arc<D>) -> Self {
        Self {
            poll_period,
            queue,
            discover,
            _event: PhantomData,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(poll_period = ?self.poll_period, "Poller started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let deadline = Instant::now() + self.poll_period;

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.poll_period, self.discover.get_items()) => {
                    match result {
                        Ok(Ok(items)) => {
                            debug!(count = items.len(), "Discovered items");
                            for item in items {
                                self.queue.enqueue(item);
                            }
                        }
                        Ok(Err(e)) => error!(error = %e, "Failed to get items"),
                        Err(_) => warn!(timeout = ?self.poll_period, "Discovery timed out"),
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        debug!("Poller stopped");
    }
}

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

use super::{Queue, ReconcileEvent};
use crate::{Error, Result};

/// Drives one entity toward its desired state.
///
/// Returning [`Error::RequeueAfter`] puts the item back on the queue after the
/// given delay. Any other error is logged and the item is released; the next
/// poll rediscovers it if it still needs work. A reconciliation that exceeds
/// the timeout is requeued after one more timeout period.
#[async_trait]
pub trait Reconcile<T: ReconcileEvent>: Send + Sync + 'static {
    async fn reconcile(&self, event: T) -> Result<()>;
}

/// Processes queued items one at a time, each under a timeout.
pub struct Reconciler<T, R> {
    reconcile_timeout: Duration,
    queue: Queue<T>,
    reconciler: Arc<R>,
    _event: PhantomData<fn() -> T>,
}

impl<T, R> Reconciler<T, R>
where
    T: ReconcileEvent,
    R: Reconcile<T>,
{
    pub fn new(reconcile_timeout: Duration, queue: Queue<T>, reconciler: Arc<R>) -> Self {
        Self {
            reconcile_timeout,
            queue,
            reconciler,
            _event: PhantomData,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(timeout = ?self.reconcile_timeout, "Reconciler started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let item = match self.queue.dequeue(&cancel).await {
                Ok(item) => item,
                Err(_) => break,
            };

            let span = info_span!("reconcile", event = %item.labels());
            let reconcile = tokio::time::timeout(
                self.reconcile_timeout,
                self.reconciler.reconcile(item.clone()),
            )
            .instrument(span.clone());

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.done(&item);
                    break;
                }
                outcome = reconcile => outcome,
            };

            span.in_scope(|| match outcome {
                Ok(Ok(())) => self.queue.done(&item),
                Ok(Err(Error::RequeueAfter { after, message })) => {
                    debug!(after = ?after, %message, "Requeueing item");
                    self.queue.requeue_after(item, after);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to reconcile item");
                    self.queue.done(&item);
                }
                Err(_) => {
                    error!(timeout = ?self.reconcile_timeout, "Reconciliation timed out, requeueing item");
                    self.queue.requeue_after(item, self.reconcile_timeout);
                }
            });
        }

        debug!("Reconciler stopped");
    }
}

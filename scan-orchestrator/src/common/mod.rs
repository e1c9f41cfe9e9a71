//! Generic poll/reconcile control loop shared by every watcher.

mod event;
pub mod fanout;
mod poller;
mod queue;
mod reconciler;

pub(crate) use event::id_event;
pub use event::{Labels, ReconcileEvent};
pub use fanout::{DEFAULT_MAX_FANOUT, FanOutReport, fan_out};
pub use poller::{Discover, Poller};
pub use queue::Queue;
pub use reconciler::{Reconcile, Reconciler};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

/// Timing of one control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLoopConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
}

/// Spawns the poller and reconciler of a watcher onto `tasks`.
///
/// Both share one queue and stop when `cancel` fires.
pub fn spawn_control_loop<T, W>(
    controller: &'static str,
    watcher: Arc<W>,
    config: ControlLoopConfig,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Queue<T>
where
    T: ReconcileEvent,
    W: Discover<T> + Reconcile<T>,
{
    let queue = Queue::new();
    let span = info_span!("watcher", controller);

    let poller = Poller::new(config.poll_period, queue.clone(), watcher.clone());
    tasks.spawn(poller.run(cancel.clone()).instrument(span.clone()));

    let reconciler = Reconciler::new(config.reconcile_timeout, queue.clone(), watcher);
    tasks.spawn(reconciler.run(cancel.clone()).instrument(span));

    info!(
        controller,
        poll_period = ?config.poll_period,
        reconcile_timeout = ?config.reconcile_timeout,
        "Watcher started"
    );
    queue
}

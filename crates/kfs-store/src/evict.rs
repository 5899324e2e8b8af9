//! Idle shard eviction worker.
//!
//! Runs on its own thread with a current-thread tokio runtime. A periodic
//! sweep queues the indexes of shards idle past the timeout; the worker
//! drains the queue and closes them one at a time.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::table::ShardTable;
use crate::StoreError;

const MIN_SWEEP: Duration = Duration::from_millis(10);
const MAX_SWEEP: Duration = Duration::from_secs(1);

/// Interval between idle sweeps for a given timeout.
fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 4).clamp(MIN_SWEEP, MAX_SWEEP)
}

/// Handle to a running eviction worker. Dropping it stops the worker.
pub(crate) struct Evictor {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Evictor {
    /// Starts a worker closing shards of `table` idle for `timeout`.
    ///
    /// The worker holds only a weak reference and exits once the table is
    /// gone.
    pub(crate) fn spawn(
        table: Weak<ShardTable>,
        timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = std::thread::Builder::new()
            .name("kfs-evict".to_string())
            .spawn(move || {
                runtime.block_on(run(table, timeout, queue_capacity.max(1), shutdown_rx))
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            // The worker may drop the last table reference itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

async fn run(
    table: Weak<ShardTable>,
    timeout: Duration,
    queue_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let (tx, mut rx) = mpsc::channel::<u32>(queue_capacity);
    let mut sweep = interval(sweep_period(timeout));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(timeout_ms = timeout.as_millis() as u64, "Eviction worker started");

    loop {
        select! {
            _ = shutdown.changed() => break,

            _ = sweep.tick() => {
                let Some(table) = table.upgrade() else { break };
                for index in table.idle_shards(timeout) {
                    if tx.try_send(index).is_err() {
                        trace!(index, "Eviction queue full");
                        break;
                    }
                }
            }

            Some(index) = rx.recv() => {
                let Some(table) = table.upgrade() else { break };
                if table.evict_if_idle(index, timeout) {
                    debug!(index, "Evicted idle shard");
                }
            }
        }
    }

    // Pending indexes are discarded with the receiver.
    debug!("Eviction worker stopped");
}

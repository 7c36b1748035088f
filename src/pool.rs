//! Ordered fork-join worker pool.
//!
//! [`process_ordered`] fans a list of tasks out to short-lived worker
//! threads and drains their results on the calling thread. The ordering
//! contract: tasks are submitted in index order and their results are
//! drained in that same index order, independent of the order in which
//! workers complete them. The drain always waits for the oldest
//! outstanding task, so a consumer writing to a sequential sink sees a
//! deterministic stream even though execution is parallel.
//!
//! Workers are spawned per call and joined before it returns; there is no
//! persistent pool. The first task or drain error aborts the whole call.
//! Channel capacities bound the undrained results held by workers to
//! O(workers); the drain-side reorder buffer is unbounded and can grow
//! toward O(items) while an early task is still outstanding, so callers
//! bound memory by bounding the items per call (the encoder submits one
//! batch at a time for exactly this reason).

use std::collections::BTreeMap;
use std::thread;

use crossbeam_channel::bounded;

use crate::error::{Error, Result};

/// Run `task` over `items` on `workers` threads, draining results in
/// submission order.
///
/// `task` receives `(index, item)` and runs on a worker thread; `drain`
/// receives `(index, result)` on the calling thread, strictly in
/// ascending index order. The first error returned by either aborts the
/// pool and is propagated; a worker that dies without reporting surfaces
/// as [`Error::WorkerPanicked`] once the pool is joined.
pub fn process_ordered<T, R, F, D>(
    items: Vec<T>,
    workers: usize,
    task: F,
    mut drain: D,
) -> Result<()>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Result<R> + Sync,
    D: FnMut(usize, R) -> Result<()>,
{
    let total = items.len();
    if total == 0 {
        return Ok(());
    }
    let workers = workers.max(1).min(total);

    thread::scope(|scope| {
        let (task_tx, task_rx) = bounded::<(usize, T)>(workers);
        let (result_tx, result_rx) = bounded::<(usize, Result<R>)>(workers);
        let task = &task;

        // Feeder: submits tasks in index order. A failed send means the
        // pool is shutting down early.
        scope.spawn(move || {
            for pair in items.into_iter().enumerate() {
                if task_tx.send(pair).is_err() {
                    break;
                }
            }
        });

        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (index, item) in task_rx {
                    if result_tx.send((index, task(index, item))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        // Reorder buffer: hold completed results until the oldest
        // outstanding index arrives, then flush in order.
        let mut pending: BTreeMap<usize, R> = BTreeMap::new();
        let mut next = 0usize;
        for (index, outcome) in result_rx {
            pending.insert(index, outcome?);
            while let Some(ready) = pending.remove(&next) {
                drain(next, ready)?;
                next += 1;
            }
        }

        if next != total {
            return Err(Error::WorkerPanicked);
        }
        Ok(())
    })
}

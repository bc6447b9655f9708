// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Deferred-work thread pool (§4.5). Blocking operations — device opens,
// client accept/teardown — run here instead of the dispatch thread; the
// worker notifies completion back onto the event loop's pipe so state
// transitions still happen on the single-threaded dispatch side.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

/// One unit of deferred work. `index`/`fd`/`arg` identify which fd slot it
/// belongs to; `job` does the actual blocking work and returns a value the
/// completion callback receives back on the dispatch thread.
pub struct WorkItem {
    pub index: usize,
    pub fd: i32,
    pub arg: i64,
    pub job: Box<dyn FnOnce() -> i64 + Send>,
}

pub struct WorkResult {
    pub index: usize,
    pub fd: i32,
    pub arg: i64,
    pub value: i64,
}

/// Fixed-size worker pool draining one shared queue. Results are posted to
/// `notify`, which in the full event loop wakes the dispatch thread via its
/// self-pipe.
pub struct WorkQueue {
    tx: Sender<WorkItem>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(threads: usize, notify: impl Fn(WorkResult) + Send + Sync + 'static) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let rx = std::sync::Arc::new(std::sync::Mutex::new(rx));
        let notify = std::sync::Arc::new(notify);
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads.max(1) {
            let rx = rx.clone();
            let notify = notify.clone();
            workers.push(std::thread::spawn(move || worker_loop(rx, notify)));
        }
        Self { tx, workers }
    }

    /// Queue one item for execution on whichever worker is free next. Items
    /// from different fd slots may complete out of order with respect to
    /// each other; items are not ordered within a slot either — callers
    /// that need ordering serialize at a higher level (`busy` flags).
    pub fn submit(&self, item: WorkItem) {
        let _ = self.tx.send(item);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(
    rx: std::sync::Arc<std::sync::Mutex<Receiver<WorkItem>>>,
    notify: std::sync::Arc<dyn Fn(WorkResult) + Send + Sync>,
) {
    loop {
        let item = {
            let guard = rx.lock().unwrap();
            guard.recv()
        };
        let Ok(item) = item else { break };
        let value = (item.job)();
        notify(WorkResult { index: item.index, fd: item.fd, arg: item.arg, value });
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Dropping `tx` unblocks every worker's `recv()` with `Err`; join
        // them so no thread outlives the queue.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_job_runs_and_notifies() {
        let got = Arc::new(AtomicI64::new(-1));
        let got2 = got.clone();
        let wq = WorkQueue::new(2, move |r: WorkResult| got2.store(r.value, Ordering::SeqCst));
        wq.submit(WorkItem { index: 0, fd: -1, arg: 7, job: Box::new(|| 42) });
        for _ in 0..200 {
            if got.load(Ordering::SeqCst) == 42 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn drop_joins_workers_cleanly() {
        let wq = WorkQueue::new(3, |_r: WorkResult| {});
        assert_eq!(wq.worker_count(), 3);
        drop(wq);
    }
}

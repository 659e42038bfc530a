use std::collections::VecDeque;
use std::sync::{mpsc, Mutex};
use std::thread;

use anyhow::{Context, Result};

/// How many requests of a batch may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Every item starts immediately.
    FanOut,
    /// A fixed number of workers drain a shared queue.
    Pool(usize),
}

impl Concurrency {
    pub fn workers(self, items: usize) -> usize {
        match self {
            Self::FanOut => items,
            Self::Pool(workers) => workers.clamp(1, items.max(1)).min(items),
        }
    }
}

/// Runs `work` once for every item on up to `workers` named threads.
/// `on_result` is called on the calling thread, in completion order, with
/// the item's original index.
pub fn drain_queue<T, R, W, F>(items: Vec<T>, workers: usize, work: W, mut on_result: F) -> Result<()>
where
    T: Send,
    R: Send,
    W: Fn(usize, T) -> R + Sync,
    F: FnMut(usize, R),
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = workers.clamp(1, items.len());
    let queue: Mutex<VecDeque<(usize, T)>> = Mutex::new(items.into_iter().enumerate().collect());
    let (tx, rx) = mpsc::channel::<(usize, R)>();

    thread::scope(|scope| -> Result<()> {
        for worker_idx in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let work = &work;
            thread::Builder::new()
                .name(format!("duky-worker-{worker_idx}"))
                .spawn_scoped(scope, move || loop {
                    let next = match queue.lock() {
                        Ok(mut pending) => pending.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some((idx, item)) = next else {
                        break;
                    };
                    if tx.send((idx, work(idx, item))).is_err() {
                        break;
                    }
                })
                .with_context(|| format!("worker thread {worker_idx} spawn failed"))?;
        }
        drop(tx);
        for (idx, result) in rx {
            on_result(idx, result);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn every_item_runs_exactly_once() -> anyhow::Result<()> {
        for size in 0..=4usize {
            let calls = AtomicUsize::new(0);
            let mut seen = vec![0usize; size];
            drain_queue(
                (0..size).map(|idx| idx * 10).collect(),
                2,
                |idx, item| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(item, idx * 10);
                    item
                },
                |idx, result| {
                    assert_eq!(result, idx * 10);
                    seen[idx] += 1;
                },
            )?;
            assert_eq!(calls.load(Ordering::SeqCst), size);
            assert!(seen.iter().all(|count| *count == 1), "size {size}: {seen:?}");
        }
        Ok(())
    }

    #[test]
    fn pool_never_exceeds_worker_count() -> anyhow::Result<()> {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        drain_queue(
            vec![(); 6],
            2,
            |_, _| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(15));
                active.fetch_sub(1, Ordering::SeqCst);
            },
            |_, _| {},
        )?;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[test]
    fn worker_counts() {
        assert_eq!(Concurrency::FanOut.workers(5), 5);
        assert_eq!(Concurrency::Pool(2).workers(5), 2);
        assert_eq!(Concurrency::Pool(2).workers(1), 1);
        assert_eq!(Concurrency::Pool(0).workers(3), 1);
        assert_eq!(Concurrency::Pool(2).workers(0), 0);
    }
}

//! Worker pool sizing and cooperative cancellation shared by the dump and
//! restore pipelines (spec §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};

/// A cheaply cloneable flag threads poll between units of work to stop
/// early without needing to unwind through a panic.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::CancellationError)` if the token has been
    /// cancelled, otherwise `Ok(())`. Intended to be called once per
    /// document or batch in the hot loops of the collection and insertion
    /// workers.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::CancellationError)
        } else {
            Ok(())
        }
    }
}

/// The number of concurrent collection workers, absent an explicit
/// `--numParallelCollections` override. Matches the historical default of
/// "the number of logical CPUs, with a floor of 4" used by the tool this
/// crate's pipelines are modeled on.
pub fn default_collection_workers() -> usize {
    num_cpus::get().max(4)
}

/// The number of insertion workers within a single collection's subpool,
/// absent an explicit override. Spec §5: defaults to 4, pinned to 1 when
/// `maintain_insertion_order` is set, since concurrent insertion workers
/// cannot guarantee batch ordering against each other.
pub fn default_insertion_workers(maintain_insertion_order: bool) -> usize {
    if maintain_insertion_order {
        1
    } else {
        4
    }
}

/// Runs `tasks` across a bounded pool of `worker_count` OS threads, each
/// pulling the next task from a shared queue, and returns each task's
/// result in the original order. A cancelled token causes outstanding
/// not-yet-started tasks to be skipped with `Error::CancellationError`
/// rather than run.
pub fn run_pool<T, F, R>(tasks: Vec<T>, worker_count: usize, token: &CancellationToken, f: F) -> Vec<Result<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    let worker_count = worker_count.max(1).min(tasks.len().max(1));
    let indexed: Vec<(usize, T)> = tasks.into_iter().enumerate().collect();
    let queue = crossbeam_channel::unbounded();
    let (tx, rx) = queue;
    for item in indexed {
        tx.send(item).expect("queue receiver outlives all senders");
    }
    drop(tx);

    let results = Arc::new(std::sync::Mutex::new(Vec::new()));
    thread::scope(|scope| {
        for _ in 0..worker_count {
            let rx = rx.clone();
            let results = Arc::clone(&results);
            let f = &f;
            scope.spawn(move || {
                while let Ok((index, item)) = rx.recv() {
                    let outcome = if token.is_cancelled() {
                        Err(Error::CancellationError)
                    } else {
                        f(item)
                    };
                    results.lock().unwrap().push((index, outcome));
                }
            });
        }
    });

    let mut results = Arc::try_unwrap(results)
        .unwrap_or_else(|_| panic!("worker threads still hold a reference"))
        .into_inner()
        .unwrap();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, outcome)| outcome).collect()
}

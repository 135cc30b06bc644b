//! Ordered execution on the shared pool
//!
//! A `Dispatcher` posts work to the `Threadpool` either freely (`submit`) or
//! through its private strand (`ordered`). Tasks on one strand never overlap
//! and run in the order they were queued, while separate dispatchers run
//! fully in parallel across the pool's workers.

use crate::utility::Threadpool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Task = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Strand
// =============================================================================

#[derive(Default)]
struct StrandState {
    queue: VecDeque<Task>,
    /// Set while a drain step is posted or running.
    in_flight: bool,
}

#[derive(Default)]
struct Strand {
    state: Mutex<StrandState>,
}

/// Releases the strand after one task, even if that task panicked.
struct Release {
    pool: Threadpool,
    strand: Arc<Strand>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let more = {
            let mut state = self.strand.state.lock();
            if state.queue.is_empty() {
                state.in_flight = false;
                false
            } else {
                true
            }
        };

        if more {
            Dispatcher::schedule(self.pool.clone(), self.strand.clone());
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Per-instance ordered dispatch over a shared pool
///
/// Clones share the same strand and therefore the same ordering domain.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Threadpool,
    strand: Arc<Strand>,
}

impl Dispatcher {
    /// Create a dispatcher with a fresh strand
    pub fn new(pool: Threadpool) -> Self {
        Self {
            pool,
            strand: Arc::new(Strand::default()),
        }
    }

    /// The pool this dispatcher posts to
    pub fn pool(&self) -> &Threadpool {
        &self.pool
    }

    /// Number of ordered tasks waiting to run
    pub fn size(&self) -> usize {
        self.strand.state.lock().queue.len()
    }

    /// Post a task with no ordering guarantee
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.post(task);
    }

    /// Post a task through this dispatcher's strand
    pub fn ordered<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let start = {
            let mut state = self.strand.state.lock();
            state.queue.push_back(Box::new(task));
            !std::mem::replace(&mut state.in_flight, true)
        };

        if start {
            Self::schedule(self.pool.clone(), self.strand.clone());
        }
    }

    /// Wrap a repeatable handler so every invocation is ordered
    pub fn ordered_delegate<A, F>(&self, handler: F) -> impl Fn(A) + Clone + Send + Sync + 'static
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let dispatcher = self.clone();
        let handler = Arc::new(handler);
        move |args: A| {
            let handler = handler.clone();
            dispatcher.ordered(move || handler(args));
        }
    }

    /// Wrap a one-shot completion handler so it runs on the strand
    pub fn ordered_delegate_once<A, F>(&self, handler: F) -> impl FnOnce(A) + Send + 'static
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let dispatcher = self.clone();
        move |args: A| dispatcher.ordered(move || handler(args))
    }

    fn schedule(pool: Threadpool, strand: Arc<Strand>) {
        let next = pool.clone();
        pool.post(move || Self::run_next(next, strand));
    }

    fn run_next(pool: Threadpool, strand: Arc<Strand>) {
        let task = strand.state.lock().queue.pop_front();
        let release = Release { pool, strand };

        if let Some(task) = task {
            task();
        }

        drop(release);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.strand.state.lock();
        f.debug_struct("Dispatcher")
            .field("queued", &state.queue.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

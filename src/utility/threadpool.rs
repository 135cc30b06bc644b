//! Shared worker pool
//!
//! A cloneable handle onto a multi-threaded tokio runtime. All handlers in
//! the crate run on the pool's worker threads.

use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Handle to the worker pool
#[derive(Clone)]
pub struct Threadpool {
    handle: Handle,
    threads: usize,
    /// Present only when this pool owns its runtime
    _runtime: Option<Arc<OwnedRuntime>>,
}

/// Shuts the runtime down without blocking, so the last clone of a pool
/// may be released from inside one of its own workers.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl Threadpool {
    /// Build a dedicated pool with the given number of worker threads
    ///
    /// Workers stop when the last clone is dropped; queued jobs are
    /// abandoned.
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("network-pool")
            .enable_all()
            .build()?;

        log::debug!("Started threadpool with {} workers", threads);

        Ok(Self {
            handle: runtime.handle().clone(),
            threads,
            _runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    /// Wrap the runtime the caller is currently running on
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    /// Wrap an existing runtime handle
    pub fn from_handle(handle: Handle) -> Self {
        let threads = handle.metrics().num_workers();
        Self {
            handle,
            threads,
            _runtime: None,
        }
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.threads
    }

    /// Underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Post a synchronous job to any worker
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { job() });
    }

    /// Spawn an asynchronous job on the pool
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Block the calling (non-worker) thread on a future
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl std::fmt::Debug for Threadpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threadpool")
            .field("threads", &self.threads)
            .field("owned", &self._runtime.is_some())
            .finish()
    }
}

//! Request-scoped deferred work.
//!
//! Tasks queued while a request is handled (the kernel's terminate hook,
//! mostly) do not run until the response has been written. The orchestrator
//! then calls [`DeferredTasks::barrier`], which starts every queued task on
//! the worker's `LocalSet` and waits for all of them, so the reset phase never
//! races a hook from the same request.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

type Task = Pin<Box<dyn Future<Output = ()>>>;

/// Queue of work to run after the current response is flushed.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone, Default)]
pub struct DeferredTasks {
    queue: Rc<RefCell<Vec<Task>>>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task`. It is not polled before the next [`barrier`](Self::barrier).
    pub fn defer<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.queue.borrow_mut().push(Box::pin(task));
    }

    /// Number of queued tasks not yet started.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run everything queued so far, including tasks queued by tasks, and
    /// wait for completion. A panicking task is logged and does not stop the
    /// others.
    ///
    /// Must be called from inside a `LocalSet`.
    pub async fn barrier(&self) -> usize {
        let mut completed = 0;
        loop {
            let batch = std::mem::take(&mut *self.queue.borrow_mut());
            if batch.is_empty() {
                return completed;
            }
            let handles: Vec<_> = batch.into_iter().map(tokio::task::spawn_local).collect();
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Deferred task failed");
                }
                completed += 1;
            }
        }
    }

    /// Drop every queued task without running it.
    pub fn abandon(&self) -> usize {
        let dropped = std::mem::take(&mut *self.queue.borrow_mut()).len();
        if dropped > 0 {
            tracing::warn!(dropped, "Abandoned deferred tasks");
        }
        dropped
    }
}

impl std::fmt::Debug for DeferredTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTasks")
            .field("pending", &self.pending())
            .finish()
    }
}

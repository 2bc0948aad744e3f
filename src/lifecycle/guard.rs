//! Per-worker request hygiene.
//!
//! # Responsibilities
//! - Count fully handled requests against the worker's ceiling
//! - Release request-scoped allocations after every request
//! - Reset every registered service, isolating failures per service
//! - Keep stray application output out of the response framing
//!
//! # Design Decisions
//! - The counter is a plain field of the worker, never a process-wide static
//! - Services are an explicit list of `Resettable` handles registered at startup
//! - A reset that errors or panics is logged and counted, then the next
//!   service is reset anyway

use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use crate::kernel::{panic_message, Resettable};
use crate::observability::metrics;

/// Requests handled by one worker, compared against its ceiling.
#[derive(Debug)]
pub struct RequestCounter {
    count: Cell<u64>,
    ceiling: u64,
}

impl RequestCounter {
    pub fn new(ceiling: u64) -> Self {
        Self {
            count: Cell::new(0),
            ceiling,
        }
    }

    /// Count one finished request. Returns true exactly once: on the request
    /// that reaches the ceiling.
    pub fn record(&self) -> bool {
        let count = self.count.get() + 1;
        self.count.set(count);
        count == self.ceiling
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}

/// Buffer catching anything application code writes outside the response.
#[derive(Debug, Default)]
pub struct OutputCapture {
    buffer: RefCell<Vec<u8>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct output from application code lands here.
    pub fn write(&self, bytes: &[u8]) {
        self.buffer.borrow_mut().extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.borrow().is_empty()
    }

    /// Throw away everything captured. Returns the number of bytes dropped.
    pub fn discard(&self) -> usize {
        let mut buffer = self.buffer.borrow_mut();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    /// Unwind pending output now and again when the scope ends, on every exit
    /// path.
    pub fn scope(self: &Rc<Self>) -> CaptureScope {
        let dropped = self.discard();
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "Discarded output pending before kernel call");
        }
        CaptureScope {
            capture: Rc::clone(self),
        }
    }
}

/// Active capture around one kernel call.
#[derive(Debug)]
pub struct CaptureScope {
    capture: Rc<OutputCapture>,
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        let dropped = self.capture.discard();
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "Discarded stray application output");
        }
    }
}

/// Post-request hooks of one worker.
pub struct LifecycleGuard {
    counter: RequestCounter,
    services: Vec<Rc<dyn Resettable>>,
}

impl LifecycleGuard {
    pub fn new(ceiling: u64) -> Self {
        Self {
            counter: RequestCounter::new(ceiling),
            services: Vec::new(),
        }
    }

    /// Register a service to reset after every request. Startup only.
    pub fn register(&mut self, service: Rc<dyn Resettable>) {
        tracing::debug!(service = service.name(), "Registered resettable service");
        self.services.push(service);
    }

    pub fn services(&self) -> usize {
        self.services.len()
    }

    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }

    /// Release the finished request's scope, then reset every service.
    ///
    /// `scope` is whatever the request owned (raw body, upload spool); it is
    /// dropped first so its memory and temp files are gone before the next
    /// request. Returns the number of services whose reset failed.
    pub fn after_request<S>(&self, scope: S) -> usize {
        drop(scope);

        let mut failures = 0;
        for service in &self.services {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| service.reset()));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            failures += 1;
            metrics::record_reset_failure(service.name());
            tracing::warn!(service = service.name(), error = %error, "Service reset failed");
        }
        failures
    }

    /// Count the finished request. True when this request reached the ceiling.
    pub fn record_request(&self) -> bool {
        self.counter.record()
    }
}

//! Application kernel boundary.
//!
//! # Data Flow
//! ```text
//! NormalizedRequest
//!     → handler/application.rs (health bypass, native conversion)
//!     → Kernel::handle (inside an output capture scope, panics caught)
//!     → NormalizedResponse
//!     → Kernel::terminate (deferred until the response is written)
//! ```
//!
//! # Design Decisions
//! - Kernels are built per worker by a `KernelFactory`; the kernel itself is
//!   owned by one single-threaded worker and may hold `Rc`/`RefCell` state
//! - Services needing a clean slate between requests are exposed as an
//!   explicit list of `Resettable` handles
//! - Failures are values (`KernelError`); panics are turned into
//!   `KernelError::Panic` at the call site

pub mod echo;
pub mod native;

use std::any::Any;
use std::future::Future;
use std::rc::Rc;

use async_trait::async_trait;

use crate::http::request::RequestId;
use crate::lifecycle::deferred::DeferredTasks;
use crate::lifecycle::guard::OutputCapture;

pub use echo::{EchoKernel, EchoKernelFactory, SessionStore};
pub use native::{KernelRequest, KernelResponse};

/// Failure raised by application code.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("{0}")]
    Message(String),
    #[error("kernel panicked: {0}")]
    Panic(String),
    #[error("kernel I/O failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl KernelError {
    pub fn message(message: impl Into<String>) -> Self {
        KernelError::Message(message.into())
    }

    /// The error and all of its sources, one per line.
    pub fn chain(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str("\ncaused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

/// A service reset failed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("reset failed: {0}")]
pub struct ResetError(String);

impl ResetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A per-request service that must be returned to a clean state between
/// requests (session storage, unit-of-work caches, connection state).
pub trait Resettable {
    fn name(&self) -> &str;
    fn reset(&self) -> Result<(), ResetError>;
}

/// Execution context of one request, handed to handlers and the kernel.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    worker: usize,
    output: Rc<OutputCapture>,
    deferred: DeferredTasks,
}

impl RequestContext {
    pub fn new(
        request_id: RequestId,
        worker: usize,
        output: Rc<OutputCapture>,
        deferred: DeferredTasks,
    ) -> Self {
        Self {
            request_id,
            worker,
            output,
            deferred,
        }
    }

    /// Standalone context, for tests and embedding without a worker.
    pub fn detached() -> Self {
        Self::new(
            RequestId::new(),
            0,
            Rc::new(OutputCapture::new()),
            DeferredTasks::new(),
        )
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Sink for direct output; never reaches the client.
    pub fn output(&self) -> &Rc<OutputCapture> {
        &self.output
    }

    pub fn deferred(&self) -> &DeferredTasks {
        &self.deferred
    }

    /// Run `task` after the response has been sent, before the next request's
    /// reset phase.
    pub fn defer<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.deferred.defer(task);
    }
}

/// The long-lived application object.
#[async_trait(?Send)]
pub trait Kernel {
    async fn handle(
        &self,
        request: KernelRequest,
        context: &RequestContext,
    ) -> Result<KernelResponse, KernelError>;

    /// Post-response bookkeeping. Runs deferred; its failure never affects
    /// the response already sent.
    async fn terminate(
        &self,
        _request: &KernelRequest,
        _response: &KernelResponse,
    ) -> Result<(), KernelError> {
        Ok(())
    }

    /// Services reset after every request, in order.
    fn resettable_services(&self) -> Vec<Rc<dyn Resettable>> {
        Vec::new()
    }
}

/// Builds one kernel per worker.
pub trait KernelFactory: Send + Sync {
    fn build(&self, worker: usize) -> Result<Rc<dyn Kernel>, KernelError>;
}

impl<F> KernelFactory for F
where
    F: Fn(usize) -> Result<Rc<dyn Kernel>, KernelError> + Send + Sync,
{
    fn build(&self, worker: usize) -> Result<Rc<dyn Kernel>, KernelError> {
        self(worker)
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

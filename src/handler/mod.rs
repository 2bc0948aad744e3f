//! Request handlers and the chain that orders them.
//!
//! # Data Flow
//! ```text
//! NormalizedRequest
//!     → chain.rs (try handlers in order, skip pass-through answers)
//!         → static_files.rs (files under the document root)
//!         → health.rs (liveness probe)
//!         → application.rs (the application kernel)
//!     → NormalizedResponse
//! ```
//!
//! # Design Decisions
//! - "Not mine" is `NormalizedResponse::pass()`, a flagged 404; a handler's
//!   own 404 is final
//! - Handlers return `Result`; only plumbing failures (file I/O) are errors,
//!   kernel failures are already responses by the time they leave a handler

pub mod application;
pub mod chain;
pub mod health;
pub mod static_files;

use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;

use crate::config::{AppConfig, HandlerKind};
use crate::http::request::NormalizedRequest;
use crate::http::response::NormalizedResponse;
use crate::kernel::{Kernel, RequestContext};

pub use application::ApplicationHandler;
pub use chain::HandlerChain;
pub use health::{health_response, HealthCheckHandler};
pub use static_files::{GuessMime, MimeDetector, StaticFileHandler, StaticFiles};

/// Failure inside a handler that no response can describe.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("static file {} could not be read", path.display())]
    StaticIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("handler I/O failed")]
    Io(#[from] std::io::Error),
}

/// One link of the chain.
#[async_trait(?Send)]
pub trait RequestHandler {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        request: &NormalizedRequest,
        context: &RequestContext,
    ) -> Result<NormalizedResponse, HandlerError>;
}

/// Compose the configured chain for one worker.
///
/// When `skip_static` is set (the orchestrator already tried the static fast
/// path) the static handler is left out so files are not looked up twice.
pub fn build_chain(config: &AppConfig, kernel: Rc<dyn Kernel>, skip_static: bool) -> HandlerChain {
    let mut chain = HandlerChain::new();
    for kind in &config.handlers {
        match kind {
            HandlerKind::Static if skip_static => {}
            HandlerKind::Static => chain.add_handler(StaticFileHandler::new(StaticFiles::new(
                config.document_root(),
            ))),
            HandlerKind::Health => chain.add_handler(HealthCheckHandler),
            HandlerKind::Application => {
                chain.add_handler(ApplicationHandler::new(Rc::clone(&kernel), config))
            }
        }
    }
    chain
}

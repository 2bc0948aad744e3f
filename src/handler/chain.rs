//! Ordered fallback dispatch.

use http::StatusCode;

use super::{HandlerError, RequestHandler};
use crate::http::request::NormalizedRequest;
use crate::http::response::NormalizedResponse;
use crate::kernel::RequestContext;

/// Handlers tried strictly in order until one answers.
///
/// Composed at startup; read-only once the worker serves traffic.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn RequestHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler after the existing ones.
    pub fn add_handler(&mut self, handler: impl RequestHandler + 'static) {
        tracing::debug!(handler = handler.name(), position = self.handlers.len(), "Handler added");
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// First answer that is not a pass-through; 404 `Not Found` when every
    /// handler passes, 404 `No handlers available` when there are none.
    pub async fn handle(
        &self,
        request: &NormalizedRequest,
        context: &RequestContext,
    ) -> Result<NormalizedResponse, HandlerError> {
        if self.handlers.is_empty() {
            return Ok(NormalizedResponse::text(
                StatusCode::NOT_FOUND,
                "No handlers available",
            ));
        }
        for handler in &self.handlers {
            let response = handler.handle(request, context).await?;
            if !response.is_pass() {
                return Ok(response);
            }
            tracing::trace!(handler = handler.name(), "Handler passed");
        }
        Ok(NormalizedResponse::text(StatusCode::NOT_FOUND, "Not Found"))
    }
}

//! Liveness probe: `/health` and `/health.php` answer 200 with the current
//! Unix time as a decimal string.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::StatusCode;

use super::{HandlerError, RequestHandler};
use crate::http::request::NormalizedRequest;
use crate::http::response::NormalizedResponse;
use crate::kernel::RequestContext;

pub const HEALTH_PATHS: [&str; 2] = ["/health", "/health.php"];

pub fn is_health_path(path: &str) -> bool {
    HEALTH_PATHS.contains(&path)
}

/// The probe answer, computed at call time.
pub fn health_response() -> NormalizedResponse {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    NormalizedResponse::text(StatusCode::OK, now.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheckHandler;

#[async_trait(?Send)]
impl RequestHandler for HealthCheckHandler {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn handle(
        &self,
        request: &NormalizedRequest,
        _context: &RequestContext,
    ) -> Result<NormalizedResponse, HandlerError> {
        if is_health_path(request.path()) {
            Ok(health_response())
        } else {
            Ok(NormalizedResponse::pass())
        }
    }
}

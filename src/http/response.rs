//! Normalized response value.
//!
//! # Responsibilities
//! - Runtime-agnostic representation of one outbound response
//! - Distinguish in-memory bodies from files sent straight from disk
//! - Carry the chain's internal "not mine" marker
//!
//! # Design Decisions
//! - `Body` is a closed enum: a response is either a buffer or a file, never both
//! - The pass-through marker never reaches the wire; it only exists so a
//!   handler's genuine 404 stays distinguishable from "try the next handler"

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::StatusCode;

use crate::http::headers::Headers;

/// Response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Buffer(Bytes),
    File(PathBuf),
}

/// The normalized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: Headers,
    body: Body,
    pass_through: bool,
}

impl NormalizedResponse {
    /// Empty buffer response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
            body: Body::Buffer(Bytes::new()),
            pass_through: false,
        }
    }

    /// Buffer response with the given status and body.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::new(status).with_body(body)
    }

    /// 200 serving a file from disk.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            body: Body::File(path.into()),
            ..Self::new(StatusCode::OK)
        }
    }

    /// The chain's "not mine" answer: a 404 flagged for the next handler.
    pub fn pass() -> Self {
        Self {
            pass_through: true,
            ..Self::new(StatusCode::NOT_FOUND)
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Buffer(body.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Explicit reason phrase, or the standard one for the status.
    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Buffer body bytes; `None` for file responses.
    pub fn buffer(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Buffer(bytes) => Some(bytes),
            Body::File(_) => None,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.body {
            Body::File(path) => Some(path),
            Body::Buffer(_) => None,
        }
    }

    /// Whether this is the chain's pass-through marker.
    pub fn is_pass(&self) -> bool {
        self.pass_through
    }
}

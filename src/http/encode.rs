//! Normalized response → wire emission.
//!
//! # Responsibilities
//! - Serialize the status line and headers, with canonical header casing
//! - Frame the body (Content-Length), leaving file bodies on disk
//! - Decide keep-alive vs. close from the original request
//!
//! # Design Decisions
//! - Strict two-way branch: request `Connection: keep-alive` (any case) keeps
//!   the connection, anything else closes it; the emitted `Connection`
//!   header always states the decision
//! - The emitter owns framing, so upstream Content-Length/Transfer-Encoding
//!   headers are replaced

use std::fmt::Write as _;
use std::path::PathBuf;

use bytes::Bytes;
use http::StatusCode;

use crate::http::headers::{canonical_name, Headers};
use crate::http::response::{Body, NormalizedResponse};

/// What happens to the connection after the response is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send and keep the connection open for the next request.
    KeepAlive,
    /// Send and close.
    Close,
}

/// Body part of an emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmissionBody {
    Buffer(Bytes),
    /// Streamed from disk by the writer.
    File { path: PathBuf, len: u64 },
}

/// A fully framed response, ready for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub status: StatusCode,
    pub head: Bytes,
    pub body: EmissionBody,
    pub action: ConnectionAction,
}

/// Keep-alive only when the request explicitly asked for it.
pub fn connection_action(request_headers: &Headers) -> ConnectionAction {
    match request_headers.get("connection") {
        Some(value) if value.trim().eq_ignore_ascii_case("keep-alive") => {
            ConnectionAction::KeepAlive
        }
        _ => ConnectionAction::Close,
    }
}

fn has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn sanitize(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Frame `response` for the connection `request_headers` arrived on.
///
/// Fails only when a file body's metadata cannot be read.
pub fn encode(
    response: &NormalizedResponse,
    request_headers: &Headers,
) -> std::io::Result<Emission> {
    let status = response.status();
    let action = connection_action(request_headers);

    let body = if has_no_body(status) {
        EmissionBody::Buffer(Bytes::new())
    } else {
        match response.body() {
            Body::Buffer(bytes) => EmissionBody::Buffer(bytes.clone()),
            Body::File(path) => EmissionBody::File {
                path: path.clone(),
                len: std::fs::metadata(path)?.len(),
            },
        }
    };

    let mut headers = response.headers().clone();
    headers.remove("content-length");
    headers.remove("transfer-encoding");
    headers.set(
        "connection",
        match action {
            ConnectionAction::KeepAlive => "keep-alive",
            ConnectionAction::Close => "close",
        },
    );
    if !has_no_body(status) {
        let len = match &body {
            EmissionBody::Buffer(bytes) => bytes.len() as u64,
            EmissionBody::File { len, .. } => *len,
        };
        headers.set("content-length", len.to_string());
    }

    let mut head = String::with_capacity(128);
    let _ = write!(
        head,
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        sanitize(response.reason_phrase())
    );
    for (name, value) in headers.iter() {
        let _ = write!(head, "{}: {}\r\n", canonical_name(name), sanitize(value));
    }
    head.push_str("\r\n");

    Ok(Emission {
        status,
        head: Bytes::from(head),
        body,
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_connection(value: Option<&str>) -> Headers {
        let mut headers = Headers::new();
        headers.append("Host", "a");
        if let Some(value) = value {
            headers.append("Connection", value);
        }
        headers
    }

    fn head_text(emission: &Emission) -> String {
        String::from_utf8(emission.head.to_vec()).unwrap()
    }

    #[test]
    fn keep_alive_in_any_case_keeps_the_connection() {
        for value in ["keep-alive", "Keep-Alive", "KEEP-ALIVE", " keep-alive "] {
            let emission = encode(
                &NormalizedResponse::text(StatusCode::OK, "hi"),
                &request_with_connection(Some(value)),
            )
            .unwrap();
            assert_eq!(emission.action, ConnectionAction::KeepAlive, "{value}");
            assert!(head_text(&emission).contains("Connection: keep-alive\r\n"));
        }
    }

    #[test]
    fn anything_else_closes() {
        for value in [None, Some("close"), Some("upgrade"), Some("")] {
            let emission = encode(
                &NormalizedResponse::text(StatusCode::OK, "hi"),
                &request_with_connection(value),
            )
            .unwrap();
            assert_eq!(emission.action, ConnectionAction::Close, "{value:?}");
            assert!(head_text(&emission).contains("Connection: close\r\n"));
        }
    }

    #[test]
    fn buffer_response_is_framed() {
        let response = NormalizedResponse::text(StatusCode::CREATED, "done")
            .with_header("content-type", "text/plain")
            .with_header("x-custom", "1")
            .with_header("Content-Length", "999");
        let emission = encode(&response, &Headers::new()).unwrap();

        let head = head_text(&emission);
        assert!(head.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("x-custom: 1\r\n"));
        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(!head.contains("999"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(emission.body, EmissionBody::Buffer(Bytes::from_static(b"done")));
    }

    #[test]
    fn file_response_reports_length_and_stays_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.svg");
        std::fs::write(&path, b"<svg/>").unwrap();

        let emission = encode(&NormalizedResponse::file(&path), &Headers::new()).unwrap();
        assert!(head_text(&emission).contains("Content-Length: 6\r\n"));
        assert_eq!(emission.body, EmissionBody::File { path, len: 6 });
    }

    #[test]
    fn missing_file_is_an_error() {
        let response = NormalizedResponse::file("/no/such/file.css");
        assert!(encode(&response, &Headers::new()).is_err());
    }

    #[test]
    fn not_modified_has_no_body() {
        let response = NormalizedResponse::text(StatusCode::NOT_MODIFIED, "ignored");
        let emission = encode(&response, &Headers::new()).unwrap();
        assert_eq!(emission.body, EmissionBody::Buffer(Bytes::new()));
        assert!(!head_text(&emission).contains("Content-Length"));
    }

    #[test]
    fn header_values_cannot_split_the_response() {
        let response = NormalizedResponse::new(StatusCode::OK)
            .with_header("X-Injected", "a\r\nSet-Cookie: evil=1");
        let head = head_text(&encode(&response, &Headers::new()).unwrap());
        assert!(head.contains("X-Injected: aSet-Cookie: evil=1\r\n"));
    }
}

//! HTTP/1.1 framing on a raw byte stream.
//!
//! # Responsibilities
//! - Read one request (head + Content-Length or chunked body) off a stream
//! - Keep leftover bytes in the caller's buffer for pipelined requests
//! - Hand multipart bodies to the upload spooler
//! - Write an encoded emission back, streaming file bodies from disk
//!
//! # Design Decisions
//! - Parsing uses `httparse`; nothing here interprets header semantics
//!   beyond framing (that is the decoder's job)
//! - Size limits are enforced before buffering more than allowed

use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::encode::{Emission, EmissionBody};
use crate::net::multipart;

const MAX_HEADERS: usize = 100;

/// Framing limits for one request.
#[derive(Debug, Clone, Copy)]
pub struct WireLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Framing failures. Every variant ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request head: {0}")]
    Malformed(httparse::Error),
    #[error("request head exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("invalid chunked body")]
    InvalidChunk,
    #[error("connection closed mid-request")]
    UnexpectedEof,
}

impl WireError {
    /// Status worth telling the client before closing, if any.
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            WireError::Io(_) | WireError::UnexpectedEof => None,
            WireError::HeadersTooLarge(_) => {
                Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            WireError::BodyTooLarge(_) => Some(http::StatusCode::PAYLOAD_TOO_LARGE),
            WireError::Malformed(_) | WireError::InvalidContentLength | WireError::InvalidChunk => {
                Some(http::StatusCode::BAD_REQUEST)
            }
        }
    }
}

/// Peer information for the connection a request arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
}

/// A request exactly as the runtime framed it.
///
/// Multipart bodies have already been split: text parts are in `form_fields`,
/// file parts are spooled to disk and described in `files` with the loose
/// `tmp_name`/`name`/`type`/`size`/`error` shape.
#[derive(Debug, Default)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub form_fields: Vec<(String, String)>,
    pub files: Map<String, Value>,
    spool: Vec<tempfile::TempPath>,
}

impl RawRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: 1,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of upload temp files this request keeps alive.
    pub fn spooled_files(&self) -> usize {
        self.spool.len()
    }
}

struct Head {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, String)>,
}

fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf).map_err(WireError::Malformed)? {
        httparse::Status::Complete(size) => {
            let head = Head {
                method: request.method.unwrap_or("GET").to_string(),
                target: request.path.unwrap_or("/").to_string(),
                version: request.version.unwrap_or(1),
                headers: request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            Ok(Some((head, size)))
        }
        httparse::Status::Partial => Ok(None),
    }
}

async fn read_more<S>(stream: &mut S, buf: &mut BytesMut) -> Result<(), WireError>
where
    S: AsyncRead + Unpin,
{
    if stream.read_buf(buf).await? == 0 {
        return Err(WireError::UnexpectedEof);
    }
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn read_chunked<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    limits: &WireLimits,
) -> Result<Bytes, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find_crlf(buf) {
                break pos;
            }
            read_more(stream, buf).await?;
        };
        let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| WireError::InvalidChunk)?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| WireError::InvalidChunk)?;
        buf.advance(line_end + 2);

        if size == 0 {
            // Trailers end with an empty line.
            loop {
                let end = loop {
                    if let Some(pos) = find_crlf(buf) {
                        break pos;
                    }
                    read_more(stream, buf).await?;
                };
                buf.advance(end + 2);
                if end == 0 {
                    return Ok(body.freeze());
                }
            }
        }

        if size > limits.max_body_bytes.saturating_sub(body.len()) {
            return Err(WireError::BodyTooLarge(limits.max_body_bytes));
        }
        while buf.len() < size + 2 {
            read_more(stream, buf).await?;
        }
        body.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(WireError::InvalidChunk);
        }
        buf.advance(size + 2);
    }
}

/// Read the next request from `stream`.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// requests. Bytes past the end of this request stay in `buf`.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    limits: &WireLimits,
) -> Result<Option<RawRequest>, WireError>
where
    S: AsyncRead + Unpin,
{
    let (head, head_len) = loop {
        if !buf.is_empty() {
            if let Some(parsed) = parse_head(buf)? {
                break parsed;
            }
        }
        if buf.len() > limits.max_header_bytes {
            return Err(WireError::HeadersTooLarge(limits.max_header_bytes));
        }
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(WireError::UnexpectedEof);
        }
    };
    if head_len > limits.max_header_bytes {
        return Err(WireError::HeadersTooLarge(limits.max_header_bytes));
    }
    buf.advance(head_len);

    let header = |name: &str| {
        head.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let chunked = header("transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let body = if chunked {
        read_chunked(stream, buf, limits).await?
    } else {
        let length = match header("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| WireError::InvalidContentLength)?,
            None => 0,
        };
        if length > limits.max_body_bytes {
            return Err(WireError::BodyTooLarge(limits.max_body_bytes));
        }
        while buf.len() < length {
            read_more(stream, buf).await?;
        }
        buf.split_to(length).freeze()
    };

    let mut request = RawRequest {
        method: head.method,
        target: head.target,
        version: head.version,
        headers: head.headers,
        body,
        ..RawRequest::default()
    };

    if let Some(content_type) = request.header("content-type").map(str::to_string) {
        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            match multipart::spool(&content_type, &request.body) {
                Ok(upload) => {
                    request.form_fields = upload.fields;
                    request.files = upload.files;
                    request.spool = upload.spool;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Multipart body not parsed; passing raw body only");
                }
            }
        }
    }

    Ok(Some(request))
}

/// Write an encoded response to the stream and flush it.
pub async fn write_emission<S>(stream: &mut S, emission: &Emission) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&emission.head).await?;
    match &emission.body {
        EmissionBody::Buffer(bytes) => stream.write_all(bytes).await?,
        EmissionBody::File { path, len } => {
            // Content-Length was fixed at encode time; never send more or less.
            let file = tokio::fs::File::open(path).await?;
            let sent = tokio::io::copy(&mut file.take(*len), stream).await?;
            if sent < *len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} shrank to {sent} of {len} bytes", path.display()),
                ));
            }
        }
    }
    stream.flush().await
}

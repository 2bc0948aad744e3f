//! The kernel's native request/response representation.
//!
//! The kernel historically ran behind a process-per-request gateway, so it
//! expects a CGI-style server parameter map next to the parsed inputs. This
//! module builds that map from a normalized request, including the pieces a
//! gateway would have synthesized: the HTTPS flag asserted by a trusted
//! proxy, the real client address, and the decomposed `Authorization` header.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::StatusCode;

use crate::config::AppConfig;
use crate::http::headers::Headers;
use crate::http::request::{FileTree, NormalizedRequest, Params};
use crate::http::response::{Body, NormalizedResponse};

/// Headers an upstream proxy may set and this deployment trusts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTrust {
    /// Any truthy value marks the request as HTTPS.
    pub https_header: Option<String>,
    /// Its value replaces `REMOTE_ADDR`.
    pub real_ip_header: Option<String>,
}

impl ProxyTrust {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            https_header: config.https_header.clone(),
            real_ip_header: config.real_ip_header.clone(),
        }
    }
}

/// Request as the kernel sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRequest {
    pub method: String,
    pub uri: String,
    pub path: String,
    pub headers: Headers,
    pub query: Params,
    pub parsed_body: Params,
    pub cookies: BTreeMap<String, String>,
    pub files: BTreeMap<String, FileTree>,
    pub server: BTreeMap<String, String>,
    pub body: Bytes,
}

impl KernelRequest {
    /// Convert `request`, applying the proxy headers `trust` allows.
    pub fn from_normalized(request: &NormalizedRequest, trust: &ProxyTrust) -> Self {
        let mut server = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            server.insert(key.to_string(), value);
        };

        set("REQUEST_METHOD", request.method().to_string());
        set("REQUEST_URI", request.uri().to_string());
        set("QUERY_STRING", request.query_string().to_string());
        set("SERVER_PROTOCOL", "HTTP/1.1".to_string());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        set("REQUEST_TIME", now.to_string());

        if let Some(addr) = request.client_addr() {
            set("REMOTE_ADDR", addr.ip().to_string());
            set("REMOTE_PORT", addr.port().to_string());
        }
        if let Some(host) = request.header("host") {
            let name = match host.rsplit_once(':') {
                Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
                _ => host,
            };
            set("SERVER_NAME", name.to_string());
        }
        for (name, value) in [
            ("content-type", "CONTENT_TYPE"),
            ("content-length", "CONTENT_LENGTH"),
        ] {
            if let Some(v) = request.header(name) {
                set(value, v.to_string());
            }
        }

        let headers = request.headers();
        for (name, _) in headers.iter() {
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            set(&key, headers.get_line(name));
        }

        if let Some(flag) = trust.https_header.as_deref() {
            if request.header(flag).is_some_and(is_truthy) {
                set("HTTPS", "on".to_string());
            }
        }
        if let Some(real_ip) = trust.real_ip_header.as_deref() {
            if let Some(ip) = request.header(real_ip) {
                set("REMOTE_ADDR", ip.to_string());
            }
        }

        if let Some(authorization) = request.header("authorization") {
            for (key, value) in authorization_params(authorization) {
                set(key, value);
            }
        }

        Self {
            method: request.method().to_string(),
            uri: request.uri().to_string(),
            path: request.path().to_string(),
            headers: headers.clone(),
            query: request.query().clone(),
            parsed_body: request.parsed_body().clone(),
            cookies: request.cookies().clone(),
            files: request.files().clone(),
            server,
            body: request.body().clone(),
        }
    }

    pub fn server_param(&self, key: &str) -> Option<&str> {
        self.server.get(key).map(String::as_str)
    }
}

/// A header value the way a loosely typed gateway would read it as a flag.
fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = value.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &value[scheme.len()..])
}

/// Server parameters a gateway derives from `Authorization`.
///
/// - `Basic` → `PHP_AUTH_USER` / `PHP_AUTH_PW`, only when the decoded
///   credentials contain a `:`
/// - `Digest` → `PHP_AUTH_DIGEST`, the raw header
/// - `Bearer` → `AUTHORIZATION`, the raw header
pub fn authorization_params(header: &str) -> Vec<(&'static str, String)> {
    if let Some(encoded) = strip_scheme(header, "basic ") {
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return Vec::new();
        };
        let decoded = String::from_utf8_lossy(&decoded);
        return match decoded.split_once(':') {
            Some((user, password)) => vec![
                ("PHP_AUTH_USER", user.to_string()),
                ("PHP_AUTH_PW", password.to_string()),
            ],
            None => Vec::new(),
        };
    }
    if strip_scheme(header, "digest ").is_some() {
        return vec![("PHP_AUTH_DIGEST", header.to_string())];
    }
    if strip_scheme(header, "bearer ").is_some() {
        return vec![("AUTHORIZATION", header.to_string())];
    }
    Vec::new()
}

/// Response as the kernel produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Body,
}

impl KernelResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Buffer(body.into()),
        }
    }

    /// Send a file from disk.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Headers::new(),
            body: Body::File(path.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

impl From<KernelResponse> for NormalizedResponse {
    fn from(response: KernelResponse) -> Self {
        let base = match response.body {
            Body::Buffer(bytes) => NormalizedResponse::new(response.status).with_body(bytes),
            Body::File(path) => NormalizedResponse::file(path).with_status(response.status),
        };
        base.with_headers(response.headers)
    }
}

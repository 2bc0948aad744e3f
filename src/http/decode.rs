//! Raw request → normalized request.
//!
//! # Responsibilities
//! - Method, target, headers, cookies, query and form body
//! - Uploaded file descriptors from the runtime's loose file map
//! - Client address from the connection
//!
//! # Design Decisions
//! - Decoding never fails: anything malformed or absent becomes an empty
//!   container or a documented default
//! - Only form content types get a parsed body; everything keeps raw bytes
//! - File maps are walked recursively; a node with a string `tmp_name` is
//!   a file, any other object is a nested field

use std::collections::BTreeMap;
use std::path::Path;

use http::Method;
use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::http::headers::Headers;
use crate::http::request::{FileTree, NormalizedRequest, Params, UploadError, UploadedFile};
use crate::net::wire::{ConnectionInfo, RawRequest};

/// Build the normalized request for `raw` arriving on `connection`.
pub fn decode(connection: &ConnectionInfo, raw: &RawRequest) -> NormalizedRequest {
    let method = Method::from_bytes(raw.method.as_bytes()).unwrap_or(Method::GET);
    let headers: Headers = raw.headers.iter().cloned().collect();

    let cookies = parse_cookies(&headers);
    let base = NormalizedRequest::new(method, raw.target.clone());
    let query = parse_form(base.query_string().as_bytes());

    let content_type = headers
        .get("content-type")
        .map(|ct| ct.to_ascii_lowercase())
        .unwrap_or_default();
    let parsed_body = if content_type.starts_with("application/x-www-form-urlencoded") {
        parse_form(&raw.body)
    } else if content_type.starts_with("multipart/form-data") {
        raw.form_fields.iter().cloned().collect()
    } else {
        Params::new()
    };

    let mut request = base
        .with_headers(headers)
        .with_cookies(cookies)
        .with_query(query)
        .with_parsed_body(parsed_body)
        .with_body(raw.body.clone())
        .with_files(uploaded_files(&raw.files));
    if let Some(remote) = connection.remote {
        request = request.with_client_addr(remote);
    }
    request
}

/// Decode `application/x-www-form-urlencoded` data.
pub fn parse_form(input: &[u8]) -> Params {
    form_urlencoded::parse(input)
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// Every `Cookie` header, split into name/value pairs. Later pairs win.
pub fn parse_cookies(headers: &Headers) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for line in headers.get_all("cookie") {
        for pair in line.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((name, value)) = form_urlencoded::parse(pair.as_bytes()).next() {
                if !name.is_empty() {
                    cookies.insert(name.into_owned(), value.into_owned());
                }
            }
        }
    }
    cookies
}

/// Walk the runtime's file map. Non-object values are dropped.
pub fn uploaded_files(files: &Map<String, Value>) -> BTreeMap<String, FileTree> {
    files
        .iter()
        .filter_map(|(key, value)| file_value(value).map(|tree| (key.clone(), tree)))
        .collect()
}

fn file_value(value: &Value) -> Option<FileTree> {
    let node = value.as_object()?;
    if matches!(node.get("tmp_name"), Some(Value::String(_))) {
        Some(FileTree::File(uploaded_file(node)))
    } else {
        Some(FileTree::Nested(uploaded_files(node)))
    }
}

/// One descriptor; missing or mistyped fields fall back to `0 / NO_FILE / "" / ""`.
pub fn uploaded_file(node: &Map<String, Value>) -> UploadedFile {
    let tmp_name = node.get("tmp_name").and_then(Value::as_str).unwrap_or("");
    let size = node.get("size").and_then(Value::as_u64).unwrap_or(0);
    let error = node
        .get("error")
        .and_then(Value::as_i64)
        .map(UploadError::from_code)
        .unwrap_or(UploadError::NoFile);
    let name = node.get("name").and_then(Value::as_str).unwrap_or("");
    let media_type = node.get("type").and_then(Value::as_str).unwrap_or("");

    let tmp_path = (!tmp_name.is_empty()).then(|| Path::new(tmp_name));
    UploadedFile::new(tmp_path, size, error, name, media_type)
}

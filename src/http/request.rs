//! Normalized request value.
//!
//! # Responsibilities
//! - Runtime-agnostic, immutable representation of one inbound request
//! - Uploaded file descriptors that default missing fields
//! - Unique request ID for tracing
//!
//! # Design Decisions
//! - Every `with_*` method consumes the value and returns a new one; there are
//!   no `&mut self` setters, so a request handed to a handler cannot change
//!   underneath anyone holding a clone
//! - Body bytes are reference counted (`Bytes`), clones are cheap

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::Method;
use uuid::Uuid;

use crate::http::headers::Headers;

/// Unique identifier for a request, carried on every log line it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered name/value pairs (query string, form body).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value wins, matching how form fields override each other.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<N, V> FromIterator<(N, V)> for Params
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Params(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// Upload status codes, numbered the way upload runtimes report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    Ok,
    IniSize,
    FormSize,
    Partial,
    NoFile,
    NoTmpDir,
    CantWrite,
    Extension,
    Other(i64),
}

impl UploadError {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => UploadError::Ok,
            1 => UploadError::IniSize,
            2 => UploadError::FormSize,
            3 => UploadError::Partial,
            4 => UploadError::NoFile,
            6 => UploadError::NoTmpDir,
            7 => UploadError::CantWrite,
            8 => UploadError::Extension,
            other => UploadError::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            UploadError::Ok => 0,
            UploadError::IniSize => 1,
            UploadError::FormSize => 2,
            UploadError::Partial => 3,
            UploadError::NoFile => 4,
            UploadError::NoTmpDir => 6,
            UploadError::CantWrite => 7,
            UploadError::Extension => 8,
            UploadError::Other(code) => *code,
        }
    }
}

/// Where an uploaded file's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStream {
    /// Spooled temp file; opened lazily on read.
    File(PathBuf),
    /// No temp path was supplied.
    Empty,
}

/// One uploaded file, owned by the request that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    client_filename: String,
    client_media_type: String,
    size: u64,
    error: UploadError,
    stream: UploadStream,
}

impl UploadedFile {
    /// Describe an upload; never fails and never touches the filesystem.
    ///
    /// A missing or unreadable temp file is only noticed by [`read_all`],
    /// while `size` and `error` keep their declared values.
    ///
    /// [`read_all`]: UploadedFile::read_all
    pub fn new(
        tmp_path: Option<&Path>,
        size: u64,
        error: UploadError,
        client_filename: impl Into<String>,
        client_media_type: impl Into<String>,
    ) -> Self {
        let stream = match tmp_path {
            Some(path) if !path.as_os_str().is_empty() => UploadStream::File(path.to_path_buf()),
            _ => UploadStream::Empty,
        };
        Self {
            client_filename: client_filename.into(),
            client_media_type: client_media_type.into(),
            size,
            error,
            stream,
        }
    }

    pub fn client_filename(&self) -> &str {
        &self.client_filename
    }

    pub fn client_media_type(&self) -> &str {
        &self.client_media_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn error(&self) -> UploadError {
        self.error
    }

    pub fn stream(&self) -> &UploadStream {
        &self.stream
    }

    /// Read the whole content. I/O problems surface here, not at construction.
    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        match &self.stream {
            UploadStream::File(path) => {
                let mut content = Vec::new();
                File::open(path)?.read_to_end(&mut content)?;
                Ok(content)
            }
            UploadStream::Empty => Ok(Vec::new()),
        }
    }
}

/// Uploaded files keyed by form field; array-style fields nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTree {
    File(UploadedFile),
    Nested(BTreeMap<String, FileTree>),
}

impl FileTree {
    pub fn as_file(&self) -> Option<&UploadedFile> {
        match self {
            FileTree::File(file) => Some(file),
            FileTree::Nested(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FileTree> {
        match self {
            FileTree::Nested(children) => children.get(key),
            FileTree::File(_) => None,
        }
    }

    /// Every file in the tree, depth first.
    pub fn files(&self) -> Vec<&UploadedFile> {
        match self {
            FileTree::File(file) => vec![file],
            FileTree::Nested(children) => children.values().flat_map(FileTree::files).collect(),
        }
    }
}

/// Drop the scheme and authority of an absolute-form target
/// (`http://host/a?b` becomes `/a?b`). Other targets are returned as is.
fn origin_form(target: &str) -> &str {
    let rest = ["http://", "https://"].iter().find_map(|scheme| {
        target
            .get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| &target[scheme.len()..])
    });
    match rest {
        Some(rest) => match rest.find(['/', '?']) {
            Some(start) => &rest[start..],
            None => "",
        },
        None => target,
    }
}

/// The normalized, immutable request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    method: Method,
    uri: String,
    path: String,
    query_string: String,
    headers: Headers,
    cookies: BTreeMap<String, String>,
    query: Params,
    parsed_body: Params,
    body: Bytes,
    files: BTreeMap<String, FileTree>,
    client_addr: Option<SocketAddr>,
}

impl NormalizedRequest {
    /// A request with only a method and a target; every container starts empty.
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query_string) = match origin_form(&uri).split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (origin_form(&uri).to_string(), String::new()),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        Self {
            method,
            uri,
            path,
            query_string,
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            query: Params::new(),
            parsed_body: Params::new(),
            body: Bytes::new(),
            files: BTreeMap::new(),
            client_addr: None,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: BTreeMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_query(mut self, query: Params) -> Self {
        self.query = query;
        self
    }

    pub fn with_parsed_body(mut self, parsed_body: Params) -> Self {
        self.parsed_body = parsed_body;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_files(mut self, files: BTreeMap<String, FileTree>) -> Self {
        self.files = files;
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request target as received (path plus query string).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn query(&self) -> &Params {
        &self.query
    }

    pub fn parsed_body(&self) -> &Params {
        &self.parsed_body
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn files(&self) -> &BTreeMap<String, FileTree> {
        &self.files
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }
}

//! Multipart form data spooling.
//!
//! Splits a buffered `multipart/form-data` body into text fields and file
//! parts. File parts are written to temp files and described in a loose
//! JSON-shaped map, nested by array-style field names:
//!
//! ```text
//! photos[trip][]  →  {"photos": {"trip": {"0": {"tmp_name": ..., "name": ...}}}}
//! ```
//!
//! Temp files live as long as the returned `TempPath`s.

use serde_json::{json, Map, Value};
use tempfile::{NamedTempFile, TempPath};

/// No file was submitted for a file input.
const UPLOAD_ERR_NO_FILE: i64 = 4;
/// The spool file could not be written.
const UPLOAD_ERR_CANT_WRITE: i64 = 7;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("missing boundary in multipart Content-Type")]
    MissingBoundary,
    #[error("multipart body does not start with the boundary")]
    MissingFirstBoundary,
    #[error("malformed multipart part: {0}")]
    MalformedPart(&'static str),
}

/// The parts of one multipart body.
#[derive(Debug, Default)]
pub struct SpooledUpload {
    pub fields: Vec<(String, String)>,
    pub files: Map<String, Value>,
    pub spool: Vec<TempPath>,
}

/// Extract the boundary parameter from a Content-Type value.
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| {
            let (name, value) = param.trim().split_once('=')?;
            name.eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .find(|b| !b.is_empty())
        .ok_or(MultipartError::MissingBoundary)
}

fn find(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}

/// `name="value"` parameter from a Content-Disposition header.
fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    disposition.split(';').skip(1).find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case(param)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Split `a[b][]` into `["a", "b", ""]`.
fn key_path(field: &str) -> Vec<String> {
    let Some(open) = field.find('[') else {
        return vec![field.to_string()];
    };
    let mut segments = vec![field[..open].to_string()];
    let mut rest = &field[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        match stripped.find(']') {
            Some(close) => {
                segments.push(stripped[..close].to_string());
                rest = &stripped[close + 1..];
            }
            None => break,
        }
    }
    segments
}

fn insert_nested(target: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let key = if first.is_empty() {
        target.len().to_string()
    } else {
        first.clone()
    };
    if rest.is_empty() {
        target.insert(key, value);
        return;
    }
    let child = target
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = child {
        insert_nested(map, rest, value);
    }
}

fn spool_file(content: &[u8]) -> std::io::Result<TempPath> {
    use std::io::Write;
    let mut file = NamedTempFile::new()?;
    file.write_all(content)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Split `body` and spool its file parts.
pub fn spool(content_type: &str, body: &[u8]) -> Result<SpooledUpload, MultipartError> {
    let boundary = format!("--{}", parse_boundary(content_type)?);
    let boundary = boundary.as_bytes();
    let mut upload = SpooledUpload::default();

    let mut pos = find(body, boundary, 0).ok_or(MultipartError::MissingFirstBoundary)?;
    loop {
        pos += boundary.len();
        if body[pos..].starts_with(b"--") {
            return Ok(upload);
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(MultipartError::MalformedPart("expected CRLF after boundary"));
        }
        pos += 2;

        let headers_end = find(body, b"\r\n\r\n", pos)
            .ok_or(MultipartError::MalformedPart("unterminated part headers"))?;
        let head = String::from_utf8_lossy(&body[pos..headers_end]).into_owned();
        let data_start = headers_end + 4;

        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(boundary);
        let data_end = find(body, &delimiter, data_start)
            .ok_or(MultipartError::MalformedPart("missing closing boundary"))?;
        let data = &body[data_start..data_end];

        let mut disposition = None;
        let mut part_type = None;
        for line in head.split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-disposition") {
                    disposition = Some(value.trim().to_string());
                } else if name.trim().eq_ignore_ascii_case("content-type") {
                    part_type = Some(value.trim().to_string());
                }
            }
        }
        let disposition =
            disposition.ok_or(MultipartError::MalformedPart("missing Content-Disposition"))?;
        let name = disposition_param(&disposition, "name")
            .ok_or(MultipartError::MalformedPart("part without a name"))?;

        match disposition_param(&disposition, "filename") {
            Some(filename) => {
                let descriptor = if filename.is_empty() {
                    json!({
                        "tmp_name": "",
                        "name": "",
                        "type": "",
                        "size": 0,
                        "error": UPLOAD_ERR_NO_FILE,
                    })
                } else {
                    match spool_file(data) {
                        Ok(path) => {
                            let value = json!({
                                "tmp_name": path.to_string_lossy(),
                                "name": filename,
                                "type": part_type.unwrap_or_default(),
                                "size": data.len(),
                                "error": 0,
                            });
                            upload.spool.push(path);
                            value
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, field = %name, "Failed to spool upload");
                            json!({
                                "name": filename,
                                "type": part_type.unwrap_or_default(),
                                "size": data.len(),
                                "error": UPLOAD_ERR_CANT_WRITE,
                            })
                        }
                    }
                };
                insert_nested(&mut upload.files, &key_path(&name), descriptor);
            }
            None => {
                upload
                    .fields
                    .push((name, String::from_utf8_lossy(data).into_owned()));
            }
        }

        pos = data_end + 2;
    }
}

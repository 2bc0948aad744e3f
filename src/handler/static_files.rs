//! Static file responder.
//!
//! # Responsibilities
//! - Map a request path onto the document root
//! - Resolve directories to `index.htm`, then `index.html`
//! - Answer conditional GETs with 304
//! - Hand matching files back as file responses (sent from disk)
//!
//! # Design Decisions
//! - Containment is textual: every literal `..` in the request path becomes
//!   `/` before the path is joined, so no segment can climb out of the root
//! - Anything with `.php` in its resolved path is left to the application
//! - "Not a file" means "not mine"; I/O failures after that point are errors

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http::StatusCode;
use tokio::io::AsyncReadExt;

use super::{HandlerError, RequestHandler};
use crate::http::request::NormalizedRequest;
use crate::http::response::NormalizedResponse;
use crate::kernel::RequestContext;

/// Bytes read from the start of a file for content sniffing.
const SAMPLE_LEN: u64 = 512;

/// Content type detection, injected into the responder.
pub trait MimeDetector {
    fn detect(&self, path: &Path, sample: &[u8]) -> String;
}

/// Extension lookup; unknown extensions are sniffed as text or binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuessMime;

impl MimeDetector for GuessMime {
    fn detect(&self, path: &Path, sample: &[u8]) -> String {
        if let Some(mime) = mime_guess::from_path(path).first() {
            return mime.essence_str().to_string();
        }
        if std::str::from_utf8(sample).is_ok() {
            "text/plain".to_string()
        } else {
            "application/octet-stream".to_string()
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub struct StaticFiles {
    root: PathBuf,
    mime: Box<dyn MimeDetector>,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_detector(root, GuessMime)
    }

    pub fn with_detector(root: impl Into<PathBuf>, mime: impl MimeDetector + 'static) -> Self {
        Self {
            root: root.into(),
            mime: Box::new(mime),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path a request path maps to, before any existence checks.
    pub fn candidate(&self, request_path: &str) -> String {
        let contained = request_path.replace("..", "/");
        format!("{}{}", self.root.display(), contained)
    }

    /// Serve `request_path` if it names a static file under the root.
    ///
    /// `Ok(None)` means "not a static file"; the request should go on to the
    /// next handler.
    pub async fn try_serve(
        &self,
        request_path: &str,
        if_modified_since: Option<&str>,
    ) -> Result<Option<NormalizedResponse>, HandlerError> {
        let mut candidate = self.candidate(request_path);

        if is_dir(Path::new(&candidate)).await {
            candidate.truncate(candidate.trim_end_matches('/').len());
            for index in ["index.htm", "index.html"] {
                let path = format!("{candidate}/{index}");
                if is_file(Path::new(&path)).await {
                    candidate = path;
                    break;
                }
            }
        }

        let path = PathBuf::from(&candidate);
        if candidate.contains(".php") || !is_file(&path).await {
            return Ok(None);
        }

        let io_error = |source| HandlerError::StaticIo {
            path: path.clone(),
            source,
        };

        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(io_error)?;
        let last_modified = httpdate::fmt_http_date(modified);

        if if_modified_since.is_some_and(|since| since == last_modified) {
            tracing::trace!(path = %path.display(), "Static file not modified");
            return Ok(Some(NormalizedResponse::new(StatusCode::NOT_MODIFIED)));
        }

        let mut sample = Vec::with_capacity(SAMPLE_LEN as usize);
        let file = tokio::fs::File::open(&path).await.map_err(io_error)?;
        file.take(SAMPLE_LEN)
            .read_to_end(&mut sample)
            .await
            .map_err(io_error)?;
        let content_type = self.mime.detect(&path, &sample);

        tracing::trace!(path = %path.display(), content_type = %content_type, "Serving static file");
        Ok(Some(
            NormalizedResponse::file(&path)
                .with_header("Content-Type", content_type)
                .with_header("Last-Modified", last_modified),
        ))
    }
}

/// [`StaticFiles`] as a chain link.
pub struct StaticFileHandler {
    files: StaticFiles,
}

impl StaticFileHandler {
    pub fn new(files: StaticFiles) -> Self {
        Self { files }
    }
}

#[async_trait(?Send)]
impl RequestHandler for StaticFileHandler {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn handle(
        &self,
        request: &NormalizedRequest,
        _context: &RequestContext,
    ) -> Result<NormalizedResponse, HandlerError> {
        let served = self
            .files
            .try_serve(request.path(), request.header("if-modified-since"))
            .await?;
        Ok(served.unwrap_or_else(NormalizedResponse::pass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// `<tmp>/public` as the root, plus a secret next to it.
    fn site() -> (TempDir, StaticFiles) {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(public.join("docs")).unwrap();
        std::fs::create_dir_all(public.join("both")).unwrap();
        std::fs::create_dir_all(public.join("empty")).unwrap();
        std::fs::write(public.join("app.css"), "body{}").unwrap();
        std::fs::write(public.join("notes"), "plain words").unwrap();
        std::fs::write(public.join("blob"), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        std::fs::write(public.join("index.php"), "<?php echo 1;").unwrap();
        std::fs::write(public.join("docs/index.html"), "<h1>docs</h1>").unwrap();
        std::fs::write(public.join("both/index.htm"), "htm").unwrap();
        std::fs::write(public.join("both/index.html"), "html").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        let files = StaticFiles::new(public);
        (dir, files)
    }

    async fn serve(files: &StaticFiles, path: &str) -> Option<NormalizedResponse> {
        files.try_serve(path, None).await.unwrap()
    }

    #[tokio::test]
    async fn serves_existing_file_with_metadata() {
        let (_dir, files) = site();
        let response = serve(&files, "/app.css").await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert!(response.header("last-modified").unwrap().ends_with(" GMT"));
        assert_eq!(response.file_path(), Some(files.root().join("app.css").as_path()));
    }

    #[tokio::test]
    async fn traversal_stays_inside_root() {
        let (_dir, files) = site();
        assert!(serve(&files, "/../secret.txt").await.is_none());
        assert!(serve(&files, "/../../../etc/passwd").await.is_none());
        assert!(files.candidate("/../../../etc/passwd").starts_with(&*files.root().to_string_lossy()));
        assert!(!files.candidate("/../../../etc/passwd").contains(".."));
    }

    #[tokio::test]
    async fn php_is_never_static() {
        let (_dir, files) = site();
        assert!(serve(&files, "/index.php").await.is_none());
    }

    #[tokio::test]
    async fn missing_file_falls_through() {
        let (_dir, files) = site();
        assert!(serve(&files, "/nope.js").await.is_none());
        assert!(serve(&files, "/empty/").await.is_none());
    }

    #[tokio::test]
    async fn directories_resolve_to_index() {
        let (_dir, files) = site();
        for path in ["/docs", "/docs/"] {
            let response = serve(&files, path).await.unwrap();
            assert_eq!(
                response.file_path(),
                Some(files.root().join("docs/index.html").as_path()),
                "{path}"
            );
        }
        let response = serve(&files, "/both").await.unwrap();
        assert_eq!(response.file_path(), Some(files.root().join("both/index.htm").as_path()));
    }

    #[tokio::test]
    async fn conditional_get() {
        let (_dir, files) = site();
        let first = serve(&files, "/app.css").await.unwrap();
        let stamp = first.header("last-modified").unwrap().to_string();

        let cached = files.try_serve("/app.css", Some(&stamp)).await.unwrap().unwrap();
        assert_eq!(cached.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(cached.buffer().map(|b| b.len()), Some(0));

        let stale = files
            .try_serve("/app.css", Some("Thu, 01 Jan 1970 00:00:00 GMT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status(), StatusCode::OK);
        assert!(stale.file_path().is_some());
    }

    #[tokio::test]
    async fn unknown_extensions_are_sniffed() {
        let (_dir, files) = site();
        let text = serve(&files, "/notes").await.unwrap();
        assert_eq!(text.header("content-type"), Some("text/plain"));
        let binary = serve(&files, "/blob").await.unwrap();
        assert_eq!(binary.header("content-type"), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn handler_passes_on_miss() {
        let (_dir, files) = site();
        let handler = StaticFileHandler::new(files);
        let response = handler
            .handle(&NormalizedRequest::get("/missing.png"), &RequestContext::detached())
            .await
            .unwrap();
        assert!(response.is_pass());

        let response = handler
            .handle(&NormalizedRequest::get("/app.css?v=3"), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    struct Fixed;

    impl MimeDetector for Fixed {
        fn detect(&self, _path: &Path, _sample: &[u8]) -> String {
            "application/x-custom".into()
        }
    }

    #[tokio::test]
    async fn detector_is_injectable() {
        let (dir, _) = site();
        let files = StaticFiles::with_detector(dir.path().join("public"), Fixed);
        let response = serve(&files, "/app.css").await.unwrap();
        assert_eq!(response.header("content-type"), Some("application/x-custom"));
    }
}

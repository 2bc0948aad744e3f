//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::cell::Cell;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use resident_server::config::ServerConfig;
use resident_server::kernel::{
    Kernel, KernelError, KernelFactory, KernelRequest, KernelResponse, RequestContext, ResetError,
    Resettable,
};
use resident_server::lifecycle::{Supervisor, SupervisorError};
use resident_server::net::bind_shared;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A supervisor running on an ephemeral port with its own project directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: broadcast::Sender<()>,
    reload: mpsc::Sender<()>,
    task: JoinHandle<Result<(), SupervisorError>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn reload(&self) {
        self.reload.send(()).await.unwrap();
    }

    pub async fn stop(self) -> Result<(), SupervisorError> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor task panicked")
    }
}

/// Lay out a small project: `public/` with a stylesheet, an index page and a
/// PHP file, plus a secret next to `public/`.
pub fn write_project(root: &Path) {
    let public = root.join("public");
    std::fs::create_dir_all(public.join("docs")).unwrap();
    std::fs::write(public.join("style.css"), "body { color: red; }").unwrap();
    std::fs::write(public.join("docs/index.html"), "<h1>docs</h1>").unwrap();
    std::fs::write(public.join("index.php"), "<?php echo 'source';").unwrap();
    std::fs::write(root.join("secret.txt"), "top secret").unwrap();
}

/// Boot `config` (address and paths overridden) with `factory`'s kernels and
/// wait until the health probe answers.
pub async fn start_server(mut config: ServerConfig, factory: Arc<dyn KernelFactory>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.app.project_dir = dir.path().to_path_buf();
    config.lifecycle.status_file = Some(dir.path().join("var/status.json"));
    config.lifecycle.shutdown_timeout_secs = 2;

    let listener = bind_shared(&config.listener).unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let (reload, reload_rx) = mpsc::channel(1);
    let task = tokio::spawn(Supervisor::new(config, factory).run(listener, reload_rx, shutdown_rx));

    let server = TestServer {
        addr,
        dir,
        shutdown,
        reload,
        task,
    };
    wait_ready(&server).await;
    server
}

async fn wait_ready(server: &TestServer) {
    let client = client();
    for _ in 0..100 {
        if let Ok(response) = client.get(server.url("/health")).send().await {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server on {} never became ready", server.addr);
}

/// A client that opens a fresh connection for every request.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// One parsed HTTP/1.1 response read off a raw socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read exactly one Content-Length framed response from `stream`.
pub async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(length);

    RawResponse {
        status,
        headers,
        body,
    }
}

/// Send raw bytes on a fresh connection and read one response.
pub async fn raw_request(addr: SocketAddr, request: &str) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(&mut stream).await
}

/// Counts resets so tests can see them through responses.
#[derive(Default)]
pub struct ResetProbe {
    resets: Cell<u64>,
}

impl Resettable for ResetProbe {
    fn name(&self) -> &str {
        "probe"
    }

    fn reset(&self) -> Result<(), ResetError> {
        self.resets.set(self.resets.get() + 1);
        Ok(())
    }
}

/// Kernel with failure switches keyed on the request path:
/// `/panic` panics, `/error` returns an error, anything else answers
/// `worker=<id> handled=<n> resets=<n>`.
pub struct FlakyKernel {
    worker: usize,
    handled: Cell<u64>,
    probe: Rc<ResetProbe>,
}

#[async_trait(?Send)]
impl Kernel for FlakyKernel {
    async fn handle(
        &self,
        request: KernelRequest,
        context: &RequestContext,
    ) -> Result<KernelResponse, KernelError> {
        context.output().write(b"debug noise that must not reach the client");
        match request.path.as_str() {
            "/panic" => panic!("kernel blew up"),
            "/error" => return Err(KernelError::message("database unreachable")),
            _ => {}
        }
        let handled = self.handled.get() + 1;
        self.handled.set(handled);
        Ok(KernelResponse::new(
            StatusCode::OK,
            format!(
                "worker={} handled={} resets={}",
                self.worker,
                handled,
                self.probe.resets.get()
            ),
        )
        .with_header("Content-Type", "text/plain"))
    }

    fn resettable_services(&self) -> Vec<Rc<dyn Resettable>> {
        vec![self.probe.clone()]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlakyFactory;

impl KernelFactory for FlakyFactory {
    fn build(&self, worker: usize) -> Result<Rc<dyn Kernel>, KernelError> {
        Ok(Rc::new(FlakyKernel {
            worker,
            handled: Cell::new(0),
            probe: Rc::new(ResetProbe::default()),
        }))
    }
}

/// Parse `key=value` pairs out of a [`FlakyKernel`] body.
pub fn field(body: &str, key: &str) -> u64 {
    body.split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or_else(|| panic!("no {key} in {body:?}"))
}

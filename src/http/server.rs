//! Request orchestrator: one inbound message, start to finish.
//!
//! # Responsibilities
//! - Decode the raw request
//! - Try the static fast path, then the handler chain
//! - Encode and send the response
//! - Run deferred work, release the request scope, reset services
//! - Count the request and report when the worker reached its ceiling
//!
//! # Design Decisions
//! - One message at a time per worker: a dispatch lock is held from decode
//!   until the reset phase ends, so request k's resets always run after its
//!   response is sent and before request k+1 dispatches
//! - Everything from decode to send sits behind one failure boundary
//!   (errors and panics); the configured `FailurePolicy` decides what a
//!   failure means, and nothing else does
//! - A client that hangs up mid-write is not a failure, only a closed
//!   connection

use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Instant;

use futures_util::FutureExt;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::config::FailurePolicy;
use crate::handler::{HandlerChain, HandlerError, StaticFiles};
use crate::http::decode::decode;
use crate::http::encode::{encode, ConnectionAction, Emission};
use crate::http::request::{NormalizedRequest, RequestId};
use crate::http::response::NormalizedResponse;
use crate::kernel::{panic_message, RequestContext};
use crate::lifecycle::deferred::DeferredTasks;
use crate::lifecycle::guard::{LifecycleGuard, OutputCapture};
use crate::net::wire::{write_emission, ConnectionInfo, RawRequest};
use crate::observability::metrics;

/// Failure inside the orchestrator's boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("response could not be encoded")]
    Encode(#[source] std::io::Error),
    #[error("request processing panicked: {0}")]
    Panic(String),
}

/// Why a worker should stop after the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The request ceiling was reached.
    RequestCeiling,
    /// A request failed and the policy is `recycle`.
    Failure,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::RequestCeiling => "request_ceiling",
            StopReason::Failure => "failure",
        }
    }
}

/// What the connection loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOutcome {
    pub status: Option<StatusCode>,
    pub action: ConnectionAction,
    pub stop: Option<StopReason>,
}

/// Per-worker entry point for every inbound message.
pub struct Orchestrator {
    worker: usize,
    chain: HandlerChain,
    fast_path: Option<StaticFiles>,
    guard: LifecycleGuard,
    output: Rc<OutputCapture>,
    deferred: DeferredTasks,
    policy: FailurePolicy,
    dispatch: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        worker: usize,
        chain: HandlerChain,
        fast_path: Option<StaticFiles>,
        guard: LifecycleGuard,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            worker,
            chain,
            fast_path,
            guard,
            output: Rc::new(OutputCapture::new()),
            deferred: DeferredTasks::new(),
            policy,
            dispatch: Mutex::new(()),
        }
    }

    pub fn guard(&self) -> &LifecycleGuard {
        &self.guard
    }

    /// Handle one message and write its response to `stream`.
    ///
    /// Must run inside the worker's `LocalSet`.
    pub async fn on_message<S>(
        &self,
        stream: &mut S,
        connection: &ConnectionInfo,
        raw: RawRequest,
    ) -> MessageOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _turn = self.dispatch.lock().await;
        let request_id = RequestId::new();
        let span = tracing::info_span!(
            "request",
            worker = self.worker,
            request_id = %request_id,
            method = %raw.method,
            target = %raw.target,
        );
        self.process(stream, connection, raw, request_id)
            .instrument(span)
            .await
    }

    async fn process<S>(
        &self,
        stream: &mut S,
        connection: &ConnectionInfo,
        raw: RawRequest,
        request_id: RequestId,
    ) -> MessageOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let context = RequestContext::new(
            request_id,
            self.worker,
            Rc::clone(&self.output),
            self.deferred.clone(),
        );

        let request = decode(connection, &raw);
        let result = AssertUnwindSafe(self.respond(&request, &context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::Panic(panic_message(panic.as_ref()))));

        let mut outcome = match result {
            Ok(emission) => self.send(stream, emission).await,
            Err(error) => self.contain(stream, &request, &error).await,
        };

        // Response is out (or abandoned): finish the request before the next
        // one may dispatch.
        let deferred = self.deferred.barrier().await;
        let reset_failures = self.guard.after_request((request, raw));
        if self.guard.record_request() {
            tracing::info!(
                handled = self.guard.counter().count(),
                "Request ceiling reached, recycling worker"
            );
            outcome.stop.get_or_insert(StopReason::RequestCeiling);
        }

        let status = outcome.status.map(|s| s.as_u16()).unwrap_or(0);
        metrics::record_request(status, started);
        tracing::debug!(
            status,
            deferred,
            reset_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        );
        outcome
    }

    /// Everything inside the failure boundary that produces an emission.
    async fn respond(
        &self,
        request: &NormalizedRequest,
        context: &RequestContext,
    ) -> Result<Emission, DispatchError> {
        let fast = match &self.fast_path {
            Some(files) => {
                files
                    .try_serve(request.path(), request.header("if-modified-since"))
                    .await?
            }
            None => None,
        };
        let response = match fast {
            Some(response) => response,
            None => self.chain.handle(request, context).await?,
        };
        encode(&response, request.headers()).map_err(DispatchError::Encode)
    }

    async fn send<S>(&self, stream: &mut S, emission: Emission) -> MessageOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match write_emission(stream, &emission).await {
            Ok(()) => MessageOutcome {
                status: Some(emission.status),
                action: emission.action,
                stop: None,
            },
            Err(e) => {
                tracing::debug!(error = %e, "Client went away during write");
                MessageOutcome {
                    status: Some(emission.status),
                    action: ConnectionAction::Close,
                    stop: None,
                }
            }
        }
    }

    /// Apply the failure policy. Nothing has been written when this runs.
    async fn contain<S>(
        &self,
        stream: &mut S,
        request: &NormalizedRequest,
        error: &DispatchError,
    ) -> MessageOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::error!(
            path = %request.path(),
            error = %error,
            source = ?std::error::Error::source(error),
            "Request processing failed"
        );
        match self.policy {
            FailurePolicy::Respond => {
                let response =
                    NormalizedResponse::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                        .with_header("Content-Type", "text/plain; charset=utf-8");
                let outcome = match encode(&response, &Default::default()) {
                    Ok(emission) => self.send(stream, emission).await,
                    Err(_) => MessageOutcome {
                        status: None,
                        action: ConnectionAction::Close,
                        stop: None,
                    },
                };
                MessageOutcome {
                    action: ConnectionAction::Close,
                    ..outcome
                }
            }
            FailurePolicy::Recycle => MessageOutcome {
                status: None,
                action: ConnectionAction::Close,
                stop: Some(StopReason::Failure),
            },
        }
    }
}

/// Bare response for requests that could not even be framed (oversized
/// headers, bad chunking). Always closes the connection.
pub fn framing_error_emission(status: StatusCode) -> Option<Emission> {
    let response = NormalizedResponse::text(status, status.canonical_reason().unwrap_or(""));
    encode(&response, &Default::default()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handler::build_chain;
    use crate::kernel::{Kernel, KernelError, KernelRequest, KernelResponse, ResetError, Resettable};
    use async_trait::async_trait;
    use std::cell::{Cell, RefCell};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::LocalSet;

    /// Shared event log for ordering assertions.
    type Log = Rc<RefCell<Vec<String>>>;

    struct Probe {
        log: Log,
    }

    #[async_trait(?Send)]
    impl Kernel for Probe {
        async fn handle(
            &self,
            request: KernelRequest,
            _context: &RequestContext,
        ) -> Result<KernelResponse, KernelError> {
            self.log.borrow_mut().push(format!("handle {}", request.path));
            tokio::task::yield_now().await;
            Ok(KernelResponse::new(StatusCode::OK, request.path))
        }

        async fn terminate(
            &self,
            request: &KernelRequest,
            _response: &KernelResponse,
        ) -> Result<(), KernelError> {
            self.log.borrow_mut().push(format!("terminate {}", request.path));
            Ok(())
        }

        fn resettable_services(&self) -> Vec<Rc<dyn Resettable>> {
            vec![Rc::new(LogReset(Rc::clone(&self.log)))]
        }
    }

    struct LogReset(Log);

    impl Resettable for LogReset {
        fn name(&self) -> &str {
            "log"
        }

        fn reset(&self) -> Result<(), ResetError> {
            self.0.borrow_mut().push("reset".into());
            Ok(())
        }
    }

    /// Panics from inside the chain, outside the kernel boundary.
    struct Exploding(Cell<u32>);

    #[async_trait(?Send)]
    impl crate::handler::RequestHandler for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn handle(
            &self,
            _request: &NormalizedRequest,
            _context: &RequestContext,
        ) -> Result<NormalizedResponse, HandlerError> {
            self.0.set(self.0.get() + 1);
            if self.0.get() == 1 {
                panic!("handler plumbing bug");
            }
            Ok(NormalizedResponse::text(StatusCode::OK, "recovered"))
        }
    }

    fn probe_orchestrator(log: &Log, ceiling: u64) -> Orchestrator {
        let kernel: Rc<dyn Kernel> = Rc::new(Probe {
            log: Rc::clone(log),
        });
        let chain = build_chain(&AppConfig::default(), Rc::clone(&kernel), true);
        let mut guard = LifecycleGuard::new(ceiling);
        for service in kernel.resettable_services() {
            guard.register(service);
        }
        Orchestrator::new(0, chain, None, guard, FailurePolicy::Respond)
    }

    fn exploding_orchestrator(policy: FailurePolicy) -> Orchestrator {
        let mut chain = HandlerChain::new();
        chain.add_handler(Exploding(Cell::new(0)));
        Orchestrator::new(0, chain, None, LifecycleGuard::new(100), policy)
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 64 * 1024];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    fn get(path: &str) -> RawRequest {
        RawRequest::new("GET", path).with_header("Connection", "keep-alive")
    }

    #[tokio::test]
    async fn resets_run_after_send_and_before_next_dispatch() {
        LocalSet::new()
            .run_until(async {
                let log: Log = Rc::default();
                let orchestrator = Rc::new(probe_orchestrator(&log, 100));
                let (mut client, mut server) = tokio::io::duplex(64 * 1024);
                let info = ConnectionInfo::default();

                let first = orchestrator.on_message(&mut server, &info, get("/one")).await;
                assert_eq!(first.action, ConnectionAction::KeepAlive);
                log.borrow_mut().push("sent /one observed".into());
                assert!(read_all(&mut client).await.ends_with("/one"));

                let second = orchestrator.on_message(&mut server, &info, get("/two")).await;
                assert_eq!(second.status, Some(StatusCode::OK));

                assert_eq!(
                    *log.borrow(),
                    vec![
                        "handle /one",
                        "terminate /one",
                        "reset",
                        "sent /one observed",
                        "handle /two",
                        "terminate /two",
                        "reset",
                    ]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn concurrent_messages_never_interleave() {
        LocalSet::new()
            .run_until(async {
                let log: Log = Rc::default();
                let orchestrator = Rc::new(probe_orchestrator(&log, 100));

                let mut tasks = Vec::new();
                for path in ["/a", "/b", "/c"] {
                    let orchestrator = Rc::clone(&orchestrator);
                    tasks.push(tokio::task::spawn_local(async move {
                        let (_client, mut server) = tokio::io::duplex(64 * 1024);
                        orchestrator
                            .on_message(&mut server, &ConnectionInfo::default(), get(path))
                            .await
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }

                let log = log.borrow();
                for chunk in log.chunks(3) {
                    let path = chunk[0].trim_start_matches("handle ");
                    assert_eq!(chunk[1], format!("terminate {path}"));
                    assert_eq!(chunk[2], "reset");
                }
                assert_eq!(log.len(), 9);
            })
            .await;
    }

    #[tokio::test]
    async fn ceiling_stops_worker_exactly_once() {
        LocalSet::new()
            .run_until(async {
                let log: Log = Rc::default();
                let orchestrator = probe_orchestrator(&log, 3);
                let (_client, mut server) = tokio::io::duplex(1024 * 1024);
                let info = ConnectionInfo::default();

                let mut stops = Vec::new();
                for i in 0..5 {
                    let outcome = orchestrator
                        .on_message(&mut server, &info, get(&format!("/{i}")))
                        .await;
                    stops.push(outcome.stop);
                }
                assert_eq!(
                    stops,
                    vec![None, None, Some(StopReason::RequestCeiling), None, None]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn respond_policy_sends_500_and_keeps_serving() {
        LocalSet::new()
            .run_until(async {
                let orchestrator = exploding_orchestrator(FailurePolicy::Respond);
                let (mut client, mut server) = tokio::io::duplex(64 * 1024);
                let info = ConnectionInfo::default();

                let failed = orchestrator.on_message(&mut server, &info, get("/")).await;
                assert_eq!(failed.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
                assert_eq!(failed.action, ConnectionAction::Close);
                assert_eq!(failed.stop, None);
                let wire = read_all(&mut client).await;
                assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
                assert!(wire.contains("Connection: close\r\n"));

                let next = orchestrator.on_message(&mut server, &info, get("/")).await;
                assert_eq!(next.status, Some(StatusCode::OK));
                assert!(read_all(&mut client).await.ends_with("recovered"));
            })
            .await;
    }

    #[tokio::test]
    async fn recycle_policy_drops_connection_and_stops_worker() {
        LocalSet::new()
            .run_until(async {
                let orchestrator = exploding_orchestrator(FailurePolicy::Recycle);
                let (_client, mut server) = tokio::io::duplex(64 * 1024);

                let failed = orchestrator
                    .on_message(&mut server, &ConnectionInfo::default(), get("/"))
                    .await;
                assert_eq!(failed.status, None);
                assert_eq!(failed.action, ConnectionAction::Close);
                assert_eq!(failed.stop, Some(StopReason::Failure));
                assert_eq!(orchestrator.guard().counter().count(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn fast_path_serves_files_before_the_chain() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                std::fs::write(dir.path().join("robots.txt"), "User-agent: *").unwrap();

                let log: Log = Rc::default();
                let kernel: Rc<dyn Kernel> = Rc::new(Probe {
                    log: Rc::clone(&log),
                });
                let chain = build_chain(&AppConfig::default(), kernel, true);
                let orchestrator = Orchestrator::new(
                    0,
                    chain,
                    Some(StaticFiles::new(dir.path())),
                    LifecycleGuard::new(100),
                    FailurePolicy::Respond,
                );
                let (mut client, mut server) = tokio::io::duplex(64 * 1024);

                let outcome = orchestrator
                    .on_message(&mut server, &ConnectionInfo::default(), get("/robots.txt"))
                    .await;
                assert_eq!(outcome.status, Some(StatusCode::OK));
                assert!(read_all(&mut client).await.ends_with("User-agent: *"));
                assert!(log.borrow().is_empty());
            })
            .await;
    }

    #[test]
    fn framing_errors_close() {
        let emission = framing_error_emission(StatusCode::PAYLOAD_TOO_LARGE).unwrap();
        assert_eq!(emission.action, ConnectionAction::Close);
        let head = String::from_utf8(emission.head.to_vec()).unwrap();
        assert!(head.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }
}

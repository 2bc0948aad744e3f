//! Application dispatch: the chain link in front of the kernel.
//!
//! # Responsibilities
//! - Answer health probes without touching the kernel
//! - Convert the request into the kernel's native form
//! - Serve debug dumps when enabled
//! - Call the kernel inside an output capture scope, containing errors and panics
//! - Defer the kernel's terminate hook until after the response is written
//!
//! # Design Decisions
//! - A kernel failure becomes a 500 here and never reaches the orchestrator;
//!   the error chain is only shown with `app.debug`
//! - The terminate hook runs for failed requests too, with the 500 it produced

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use async_trait::async_trait;
use futures_util::FutureExt;
use http::StatusCode;
use serde_json::json;

use super::health::{health_response, is_health_path};
use super::{HandlerError, RequestHandler};
use crate::config::AppConfig;
use crate::http::request::NormalizedRequest;
use crate::http::response::NormalizedResponse;
use crate::kernel::native::ProxyTrust;
use crate::kernel::{panic_message, Kernel, KernelError, KernelRequest, KernelResponse, RequestContext};
use crate::observability::metrics;

const DUMP_HEADERS: &str = "debug-dump-header";
const DUMP_SERVER: &str = "debug-dump-server";
const DUMP_ENV: &str = "debug-dump-env";

pub struct ApplicationHandler {
    kernel: Rc<dyn Kernel>,
    trust: ProxyTrust,
    debug: bool,
    debug_dumps: bool,
}

impl ApplicationHandler {
    pub fn new(kernel: Rc<dyn Kernel>, config: &AppConfig) -> Self {
        Self {
            kernel,
            trust: ProxyTrust::from_config(config),
            debug: config.debug,
            debug_dumps: config.debug_dumps,
        }
    }

    fn failure_response(&self, error: &KernelError) -> KernelResponse {
        let body = if self.debug {
            error.chain()
        } else {
            "Internal Server Error".to_string()
        };
        KernelResponse::new(StatusCode::INTERNAL_SERVER_ERROR, body)
            .with_header("Content-Type", "text/plain; charset=utf-8")
    }

    fn debug_dump(&self, native: &KernelRequest) -> Option<NormalizedResponse> {
        if !self.debug_dumps {
            return None;
        }
        let flag = |name: &str| {
            native
                .query
                .get(name)
                .is_some_and(|v| !v.is_empty() && v != "0")
        };
        let dump = if flag(DUMP_HEADERS) {
            let mut headers: BTreeMap<String, Vec<&str>> = BTreeMap::new();
            for (name, value) in native.headers.iter() {
                headers.entry(name.to_ascii_lowercase()).or_default().push(value);
            }
            json!(headers)
        } else if flag(DUMP_SERVER) {
            json!(native.server)
        } else if flag(DUMP_ENV) {
            json!(std::env::vars().collect::<BTreeMap<_, _>>())
        } else {
            return None;
        };
        Some(
            NormalizedResponse::text(StatusCode::OK, dump.to_string())
                .with_header("Content-Type", "application/json"),
        )
    }

    async fn call_kernel(&self, native: KernelRequest, context: &RequestContext) -> KernelResponse {
        let _capture = context.output().scope();
        let outcome = AssertUnwindSafe(self.kernel.handle(native, context))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(response)) => return response,
            Ok(Err(e)) => e,
            Err(panic) => KernelError::Panic(panic_message(panic.as_ref())),
        };
        metrics::record_kernel_error();
        tracing::error!(
            request_id = %context.request_id(),
            error = %error.chain(),
            "Uncaught exception while handling request"
        );
        self.failure_response(&error)
    }

    fn defer_terminate(&self, context: &RequestContext, native: KernelRequest, response: KernelResponse) {
        let kernel = Rc::clone(&self.kernel);
        let request_id = context.request_id();
        context.defer(async move {
            let outcome = AssertUnwindSafe(kernel.terminate(&native, &response))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.chain(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::error!(request_id = %request_id, error = %error, "Terminate hook failed");
        });
    }
}

#[async_trait(?Send)]
impl RequestHandler for ApplicationHandler {
    fn name(&self) -> &'static str {
        "application"
    }

    async fn handle(
        &self,
        request: &NormalizedRequest,
        context: &RequestContext,
    ) -> Result<NormalizedResponse, HandlerError> {
        if is_health_path(request.path()) {
            return Ok(health_response());
        }

        let native = KernelRequest::from_normalized(request, &self.trust);
        if let Some(dump) = self.debug_dump(&native) {
            return Ok(dump);
        }

        let response = self.call_kernel(native.clone(), context).await;
        let normalized = NormalizedResponse::from(response.clone());
        self.defer_terminate(context, native, response);
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::EchoKernel;
    use std::cell::{Cell, RefCell};
    use tokio::task::LocalSet;

    #[derive(Default)]
    struct Scripted {
        calls: Cell<u32>,
        fail_first: bool,
        panic_first: bool,
        terminated: RefCell<Vec<u16>>,
        terminate_fails: bool,
        seen: RefCell<Option<KernelRequest>>,
    }

    #[async_trait(?Send)]
    impl Kernel for Scripted {
        async fn handle(
            &self,
            request: KernelRequest,
            context: &RequestContext,
        ) -> Result<KernelResponse, KernelError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            context.output().write(b"stray");
            *self.seen.borrow_mut() = Some(request);
            if call == 1 && self.panic_first {
                panic!("kernel exploded");
            }
            if call == 1 && self.fail_first {
                return Err(KernelError::message("database unreachable"));
            }
            Ok(KernelResponse::new(StatusCode::OK, format!("call {call}")))
        }

        async fn terminate(
            &self,
            _request: &KernelRequest,
            response: &KernelResponse,
        ) -> Result<(), KernelError> {
            self.terminated.borrow_mut().push(response.status.as_u16());
            if self.terminate_fails {
                Err(KernelError::message("flush failed"))
            } else {
                Ok(())
            }
        }
    }

    fn handler(kernel: Rc<dyn Kernel>, debug: bool) -> ApplicationHandler {
        let config = AppConfig {
            debug,
            debug_dumps: true,
            ..AppConfig::default()
        };
        ApplicationHandler::new(kernel, &config)
    }

    fn text(response: &NormalizedResponse) -> String {
        String::from_utf8(response.buffer().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn kernel_error_becomes_response_and_worker_continues() {
        let kernel = Rc::new(Scripted {
            fail_first: true,
            ..Scripted::default()
        });
        let app = handler(kernel.clone(), false);
        let context = RequestContext::detached();

        let first = app.handle(&NormalizedRequest::get("/a"), &context).await.unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text(&first), "Internal Server Error");

        let second = app.handle(&NormalizedRequest::get("/b"), &context).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(text(&second), "call 2");
    }

    #[tokio::test]
    async fn kernel_panic_is_contained() {
        let kernel = Rc::new(Scripted {
            panic_first: true,
            ..Scripted::default()
        });
        let app = handler(kernel.clone(), true);
        let context = RequestContext::detached();

        let first = app.handle(&NormalizedRequest::get("/a"), &context).await.unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text(&first).contains("kernel exploded"));
        assert!(context.output().is_empty());

        let second = app.handle(&NormalizedRequest::get("/b"), &context).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn debug_mode_shows_error_text() {
        let kernel = Rc::new(Scripted {
            fail_first: true,
            ..Scripted::default()
        });
        let app = handler(kernel, true);
        let response = app
            .handle(&NormalizedRequest::get("/"), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(text(&response), "database unreachable");
    }

    #[tokio::test]
    async fn health_bypasses_kernel() {
        let kernel = Rc::new(Scripted::default());
        let app = handler(kernel.clone(), false);
        for path in ["/health", "/health.php"] {
            let response = app
                .handle(&NormalizedRequest::get(path), &RequestContext::detached())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(text(&response).parse::<u64>().is_ok());
        }
        assert_eq!(kernel.calls.get(), 0);
    }

    #[tokio::test]
    async fn terminate_is_deferred_until_barrier() {
        LocalSet::new()
            .run_until(async {
                let kernel = Rc::new(Scripted {
                    fail_first: true,
                    terminate_fails: true,
                    ..Scripted::default()
                });
                let app = handler(kernel.clone(), false);
                let context = RequestContext::detached();

                app.handle(&NormalizedRequest::get("/"), &context).await.unwrap();
                assert!(kernel.terminated.borrow().is_empty());
                assert_eq!(context.deferred().pending(), 1);

                context.deferred().barrier().await;
                assert_eq!(*kernel.terminated.borrow(), vec![500]);
            })
            .await;
    }

    #[tokio::test]
    async fn native_request_carries_proxy_and_auth_fields() {
        let kernel = Rc::new(Scripted::default());
        let app = handler(kernel.clone(), false);
        let request = NormalizedRequest::get("/secure")
            .with_header("Force-Https", "on")
            .with_header("X-Real-IP", "198.51.100.4")
            .with_header("Authorization", "Basic dXNlcjpwYXNz")
            .with_client_addr("10.0.0.1:5000".parse().unwrap());

        app.handle(&request, &RequestContext::detached()).await.unwrap();

        let seen = kernel.seen.borrow();
        let native = seen.as_ref().unwrap();
        assert_eq!(native.server_param("HTTPS"), Some("on"));
        assert_eq!(native.server_param("REMOTE_ADDR"), Some("198.51.100.4"));
        assert_eq!(native.server_param("PHP_AUTH_USER"), Some("user"));
        assert_eq!(native.server_param("PHP_AUTH_PW"), Some("pass"));
    }

    #[tokio::test]
    async fn debug_dumps_bypass_kernel() {
        let kernel = Rc::new(Scripted::default());
        let app = handler(kernel.clone(), false);
        let request = NormalizedRequest::get("/?debug-dump-server=1")
            .with_query([("debug-dump-server", "1")].into_iter().collect());

        let response = app.handle(&request, &RequestContext::detached()).await.unwrap();
        let dump: serde_json::Value = serde_json::from_str(&text(&response)).unwrap();
        assert_eq!(dump["REQUEST_URI"], "/?debug-dump-server=1");
        assert_eq!(kernel.calls.get(), 0);
    }

    #[tokio::test]
    async fn debug_dumps_are_off_by_default() {
        let kernel = Rc::new(EchoKernel::new());
        let app = ApplicationHandler::new(kernel, &AppConfig::default());
        let request = NormalizedRequest::get("/?debug-dump-env=1")
            .with_query([("debug-dump-env", "1")].into_iter().collect());

        let response = app.handle(&request, &RequestContext::detached()).await.unwrap();
        let echo: serde_json::Value = serde_json::from_str(&text(&response)).unwrap();
        assert_eq!(echo["path"], "/");
    }
}

//! Bundled demonstration kernel.
//!
//! Answers every request with a JSON description of the native request it
//! received. Keeps a small per-request session store so the reset cycle is
//! observable: `session_entries` in the echo is always 0 when resets run.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{json, Map, Value};

use super::{
    Kernel, KernelError, KernelFactory, KernelRequest, KernelResponse, RequestContext, ResetError,
    Resettable,
};
use crate::http::request::FileTree;

/// Request-scoped key/value state, cleared between requests.
#[derive(Debug, Default)]
pub struct SessionStore {
    entries: RefCell<BTreeMap<String, String>>,
}

impl SessionStore {
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.borrow_mut().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl Resettable for SessionStore {
    fn name(&self) -> &str {
        "session"
    }

    fn reset(&self) -> Result<(), ResetError> {
        self.entries.borrow_mut().clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EchoKernel {
    sessions: Rc<SessionStore>,
    handled: Cell<u64>,
    terminated: Cell<u64>,
}

impl EchoKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &Rc<SessionStore> {
        &self.sessions
    }

    pub fn terminated(&self) -> u64 {
        self.terminated.get()
    }
}

fn files_json(files: &BTreeMap<String, FileTree>) -> Value {
    let mut out = Map::new();
    for (field, tree) in files {
        let value = match tree {
            FileTree::File(file) => json!({
                "name": file.client_filename(),
                "type": file.client_media_type(),
                "size": file.size(),
                "error": file.error().code(),
            }),
            FileTree::Nested(children) => files_json(children),
        };
        out.insert(field.clone(), value);
    }
    Value::Object(out)
}

fn params_json<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Value {
    Value::Object(
        pairs
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect(),
    )
}

#[async_trait(?Send)]
impl Kernel for EchoKernel {
    async fn handle(
        &self,
        request: KernelRequest,
        context: &RequestContext,
    ) -> Result<KernelResponse, KernelError> {
        let handled = self.handled.get() + 1;
        self.handled.set(handled);

        let session_entries = self.sessions.len();
        self.sessions.insert("last_path", request.path.clone());
        context.output().write(b"echo kernel debug output\n");

        let body = json!({
            "worker": context.worker(),
            "request_id": context.request_id().to_string(),
            "handled": handled,
            "session_entries": session_entries,
            "method": request.method,
            "path": request.path,
            "query": params_json(request.query.iter()),
            "body_params": params_json(request.parsed_body.iter()),
            "cookies": request.cookies,
            "files": files_json(&request.files),
            "server": request.server,
            "body_length": request.body.len(),
        });
        let body = serde_json::to_vec(&body).map_err(|e| KernelError::Other(Box::new(e)))?;

        Ok(KernelResponse::new(StatusCode::OK, body)
            .with_header("Content-Type", "application/json"))
    }

    async fn terminate(
        &self,
        request: &KernelRequest,
        response: &KernelResponse,
    ) -> Result<(), KernelError> {
        self.terminated.set(self.terminated.get() + 1);
        tracing::debug!(
            path = %request.path,
            status = response.status.as_u16(),
            "Echo request terminated"
        );
        Ok(())
    }

    fn resettable_services(&self) -> Vec<Rc<dyn Resettable>> {
        vec![self.sessions.clone()]
    }
}

/// Builds an [`EchoKernel`] for every worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoKernelFactory;

impl KernelFactory for EchoKernelFactory {
    fn build(&self, worker: usize) -> Result<Rc<dyn Kernel>, KernelError> {
        tracing::debug!(worker, "Building echo kernel");
        Ok(Rc::new(EchoKernel::new()))
    }
}

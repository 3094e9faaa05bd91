use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde_json::Value;

use crate::broker::Peer;
use crate::execution::listener::{fire_isolated, panic_message};
use crate::execution::{CancelListener, ExecutionTask, ListenerId, attach_server_execution};
use crate::invocation::cancel_registry::CancelRegistry;
use crate::invocation::client::timeout_error;
use crate::invocation::{
    InterimRequestCallback, InterimResponseCallback, InvocationCallback, InvocationResultCallback,
};
use crate::models::error::poisoned;
use crate::models::{
    CoreError, CoreErrorKind, CoreResult, InvocationId, InvocationMessage, Message, RequestId,
    ResultMessage,
};

/// Name under which a dispatcher lists its own methods once discovery is served.
pub const DISCOVERY_METHOD: &str = "courier.methods";

/// A locally bound service. It may complete synchronously or hold on to `result` and
/// complete later from another thread; returning an error is the same as calling
/// `result.exception`.
pub trait MethodHandler: Send + Sync {
    fn invoke(
        &self,
        result: Arc<dyn InvocationCallback>,
        progress: Arc<dyn InterimResponseCallback>,
        question: Arc<dyn InterimRequestCallback>,
        parameter: Value,
    ) -> CoreResult<()>;
}

impl<F> MethodHandler for F
where
    F: Fn(
            Arc<dyn InvocationCallback>,
            Arc<dyn InterimResponseCallback>,
            Arc<dyn InterimRequestCallback>,
            Value,
        ) -> CoreResult<()>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        result: Arc<dyn InvocationCallback>,
        progress: Arc<dyn InterimResponseCallback>,
        question: Arc<dyn InterimRequestCallback>,
        parameter: Value,
    ) -> CoreResult<()> {
        self(result, progress, question, parameter)
    }
}

/// Plain request/response method without interim traffic.
pub struct SyncMethod<F> {
    function: F,
}

impl<F> SyncMethod<F>
where
    F: Fn(Value) -> CoreResult<Value> + Send + Sync,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F> MethodHandler for SyncMethod<F>
where
    F: Fn(Value) -> CoreResult<Value> + Send + Sync,
{
    fn invoke(
        &self,
        result: Arc<dyn InvocationCallback>,
        _progress: Arc<dyn InterimResponseCallback>,
        _question: Arc<dyn InterimRequestCallback>,
        parameter: Value,
    ) -> CoreResult<()> {
        result.finished((self.function)(parameter)?);
        Ok(())
    }
}

/// Method that runs against a fresh [`ExecutionTask`] whose progress and questions are
/// forwarded to the caller and which is canceled when the caller cancels.
pub struct ExecutionMethod<F> {
    function: F,
}

impl<F> ExecutionMethod<F>
where
    F: Fn(&ExecutionTask, Value) -> CoreResult<Value> + Send + Sync,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F> MethodHandler for ExecutionMethod<F>
where
    F: Fn(&ExecutionTask, Value) -> CoreResult<Value> + Send + Sync,
{
    fn invoke(
        &self,
        result: Arc<dyn InvocationCallback>,
        progress: Arc<dyn InterimResponseCallback>,
        question: Arc<dyn InterimRequestCallback>,
        parameter: Value,
    ) -> CoreResult<()> {
        let task = ExecutionTask::new();
        attach_server_execution(&task, result.as_ref(), progress, question);

        let outcome = (self.function)(&task, parameter);
        if task.is_canceled() {
            result.exception(CoreError::cancelled("execution canceled"));
            return Ok(());
        }
        match outcome {
            Ok(value) => {
                task.finished();
                result.finished(value);
            }
            Err(error) => {
                task.dispose();
                result.exception(error);
            }
        }
        Ok(())
    }
}

/// Server half of the protocol: runs locally bound methods for inbound invocations and
/// relays their outcome, progress and questions back to the calling peer.
#[derive(Clone, Default)]
pub struct MethodDispatcher {
    inner: Arc<DispatchInner>,
}

#[derive(Default)]
struct DispatchInner {
    methods: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    cancellation: CancelRegistry,
    pending_requests: Mutex<HashMap<RequestId, PendingRequest>>,
}

struct PendingRequest {
    invocation_id: InvocationId,
    reply: Arc<dyn InterimResponseCallback>,
}

impl MethodDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `name`, replacing any previous binding.
    pub fn register_method(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> CoreResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "method name must not be empty",
            ));
        }
        self.inner
            .methods
            .write()
            .map_err(|_| poisoned("method registry"))?
            .insert(name, handler);
        Ok(())
    }

    pub fn method_names(&self) -> Vec<String> {
        list_methods(&self.inner)
    }

    /// Registers [`DISCOVERY_METHOD`], which answers with the sorted names of every
    /// other method bound to this dispatcher.
    pub fn serve_discovery(&self) -> CoreResult<()> {
        let methods = Arc::downgrade(&self.inner);
        self.register_method(
            DISCOVERY_METHOD,
            Arc::new(SyncMethod::new(move |_: Value| discovery_listing(&methods))),
        )
    }

    pub fn active_invocations(&self) -> usize {
        self.inner.cancellation.open_count()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn handle_invocation(&self, message: InvocationMessage, peer: Peer) {
        match message {
            InvocationMessage::Invoke {
                invocation_id,
                method,
                parameter,
            } => self.invoke(invocation_id, &method, parameter, peer),
            InvocationMessage::Cancel { invocation_id } => {
                if self.inner.cancellation.cancel(&invocation_id) {
                    tracing::debug!(invocation_id = %invocation_id, "invocation canceled by peer");
                } else {
                    tracing::debug!(invocation_id = %invocation_id, "cancel for inactive invocation dropped");
                }
            }
            InvocationMessage::Response {
                invocation_id,
                request_id,
                response,
            } => {
                let pending = self.inner.pending().remove(&request_id);
                match pending {
                    Some(pending) => fire_isolated(|| pending.reply.do_response(response)),
                    None => tracing::debug!(
                        invocation_id = %invocation_id,
                        request_id = %request_id,
                        "answer for unknown interim request dropped"
                    ),
                }
            }
        }
    }

    fn invoke(&self, invocation_id: InvocationId, method: &str, parameter: Value, peer: Peer) {
        let handler = self
            .inner
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();

        self.inner.cancellation.open(&invocation_id);
        let callback = Arc::new(ServerInvocationCallback {
            invocation_id: invocation_id.clone(),
            peer: peer.clone(),
            dispatch: self.inner.clone(),
            completed: AtomicBool::new(false),
        });

        let Some(handler) = handler else {
            callback.exception(CoreError::new(
                CoreErrorKind::MethodNotFound,
                format!("no method '{method}' is bound on this node"),
            ));
            return;
        };

        let progress = Arc::new(ServerProgress {
            invocation_id: invocation_id.clone(),
            peer: peer.clone(),
            dispatch: self.inner.clone(),
        });
        let question = Arc::new(ServerQuestion {
            invocation_id: invocation_id.clone(),
            peer,
            dispatch: self.inner.clone(),
        });

        tracing::debug!(invocation_id = %invocation_id, method, "dispatching invocation");
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.invoke(callback.clone(), progress, question, parameter)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => callback.exception(error),
            Err(panic) => {
                tracing::error!(
                    invocation_id = %invocation_id,
                    method,
                    panic = %panic_message(panic.as_ref()),
                    "method panicked"
                );
                callback.exception(CoreError::new(
                    CoreErrorKind::Remote,
                    format!(
                        "method '{method}' panicked: {}",
                        panic_message(panic.as_ref())
                    ),
                ));
            }
        }
    }
}

impl DispatchInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, invocation_id: &InvocationId) {
        self.cancellation.close(invocation_id);
        self.pending()
            .retain(|_, pending| &pending.invocation_id != invocation_id);
    }
}

struct ServerInvocationCallback {
    invocation_id: InvocationId,
    peer: Peer,
    dispatch: Arc<DispatchInner>,
    completed: AtomicBool,
}

impl ServerInvocationCallback {
    fn complete(&self, message: ResultMessage) {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::debug!(invocation_id = %self.invocation_id, "second terminal outcome ignored");
            return;
        }
        self.dispatch.release(&self.invocation_id);
        if let Err(error) = self.peer.send(Message::Result(message)) {
            tracing::error!(
                invocation_id = %self.invocation_id,
                broker = %self.peer.broker_id(),
                %error,
                "failed to send terminal outcome"
            );
        }
    }
}

impl InvocationResultCallback for ServerInvocationCallback {
    fn finished(&self, result: Value) {
        self.complete(ResultMessage::Finished {
            invocation_id: self.invocation_id.clone(),
            result,
        });
    }

    fn exception(&self, error: CoreError) {
        self.complete(ResultMessage::Exception {
            invocation_id: self.invocation_id.clone(),
            error: error.with_invocation(&self.invocation_id),
        });
    }

    fn timeout(&self) {
        self.complete(ResultMessage::Exception {
            invocation_id: self.invocation_id.clone(),
            error: timeout_error(Some(&self.invocation_id), "server-side execution timed out"),
        });
    }
}

impl InvocationCallback for ServerInvocationCallback {
    fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
        self.dispatch.cancellation.add(&self.invocation_id, listener)
    }

    fn remove_cancel_listener(&self, id: ListenerId) -> bool {
        self.dispatch.cancellation.remove(&self.invocation_id, id)
    }
}

struct ServerProgress {
    invocation_id: InvocationId,
    peer: Peer,
    dispatch: Arc<DispatchInner>,
}

impl InterimResponseCallback for ServerProgress {
    fn do_response(&self, response: Value) {
        if !self.dispatch.cancellation.is_open(&self.invocation_id) {
            return;
        }
        let message = Message::Result(ResultMessage::InterimResponse {
            invocation_id: self.invocation_id.clone(),
            response,
        });
        if let Err(error) = self.peer.send(message) {
            tracing::warn!(invocation_id = %self.invocation_id, %error, "failed to send progress");
        }
    }
}

struct ServerQuestion {
    invocation_id: InvocationId,
    peer: Peer,
    dispatch: Arc<DispatchInner>,
}

impl InterimRequestCallback for ServerQuestion {
    fn do_request(&self, reply: Arc<dyn InterimResponseCallback>, request: Value) {
        if !self.dispatch.cancellation.is_open(&self.invocation_id) {
            return;
        }
        let request_id = RequestId::generate();
        self.dispatch.pending().insert(
            request_id.clone(),
            PendingRequest {
                invocation_id: self.invocation_id.clone(),
                reply,
            },
        );

        let message = Message::Result(ResultMessage::InterimRequest {
            invocation_id: self.invocation_id.clone(),
            request_id: request_id.clone(),
            request,
        });
        if let Err(error) = self.peer.send(message) {
            self.dispatch.pending().remove(&request_id);
            tracing::warn!(
                invocation_id = %self.invocation_id,
                request_id = %request_id,
                %error,
                "failed to send interim question"
            );
        }
    }
}

fn list_methods(inner: &DispatchInner) -> Vec<String> {
    let mut names: Vec<String> = inner
        .methods
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

fn discovery_listing(methods: &Weak<DispatchInner>) -> CoreResult<Value> {
    let inner = methods.upgrade().ok_or_else(|| {
        CoreError::new(CoreErrorKind::InvalidState, "method dispatcher was dropped")
    })?;
    let names: Vec<String> = list_methods(&inner)
        .into_iter()
        .filter(|name| name != DISCOVERY_METHOD)
        .collect();
    Ok(Value::from(names))
}

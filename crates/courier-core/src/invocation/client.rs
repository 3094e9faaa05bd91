use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::broker::Peer;
use crate::execution::ListenerId;
use crate::execution::listener::fire_isolated;
use crate::invocation::{InterimRequestCallback, InterimResponseCallback, InvocationCallback};
use crate::models::error::poisoned;
use crate::models::{
    BrokerId, CoreError, CoreErrorKind, CoreResult, InvocationId, InvocationMessage, Message,
    RequestId, ResultMessage,
};

/// Outstanding invocation as seen from outside the correlation map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvocationInfo {
    pub invocation_id: InvocationId,
    pub server_id: BrokerId,
    pub timeout: Duration,
    pub created_at: SystemTime,
}

/// Client-side correlation map from invocation id to the caller's callbacks.
///
/// A record is removed under the map lock before any terminal callback runs, so
/// whichever of finished, exception, timeout or cancellation gets there first is the
/// only one that is delivered.
#[derive(Clone)]
pub struct InvocationClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    runtime: Handle,
    records: Mutex<HashMap<InvocationId, InvocationRecord>>,
}

struct InvocationRecord {
    peer: Peer,
    result: Arc<dyn InvocationCallback>,
    progress: Arc<dyn InterimResponseCallback>,
    question: Arc<dyn InterimRequestCallback>,
    timeout: Duration,
    created_at: SystemTime,
    timer: Option<AbortHandle>,
    cancel_listener: Option<ListenerId>,
}

impl InvocationRecord {
    fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(listener) = self.cancel_listener.take() {
            self.result.remove_cancel_listener(listener);
        }
    }
}

impl InvocationClient {
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                runtime,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Stores the callbacks under a fresh id, arms the timeout and subscribes to the
    /// result callback's cancellation. The returned id goes into the outbound message.
    ///
    /// Fails with a `Cancelled` error when `result` was canceled before or during
    /// registration; nothing is left pending in that case.
    pub fn register_invocation(
        &self,
        result: Arc<dyn InvocationCallback>,
        progress: Arc<dyn InterimResponseCallback>,
        question: Arc<dyn InterimRequestCallback>,
        timeout: Duration,
        peer: Peer,
    ) -> CoreResult<InvocationId> {
        let invocation_id = InvocationId::generate();
        self.try_lock()?.insert(
            invocation_id.clone(),
            InvocationRecord {
                peer,
                result: result.clone(),
                progress,
                question,
                timeout,
                created_at: SystemTime::now(),
                timer: None,
                cancel_listener: None,
            },
        );

        let listener = result.add_cancel_listener(Arc::new({
            let client = self.clone();
            let invocation_id = invocation_id.clone();
            move || {
                client.cancel(&invocation_id);
            }
        }));

        let timer = self
            .inner
            .runtime
            .spawn({
                let client = self.clone();
                let invocation_id = invocation_id.clone();
                async move {
                    tokio::time::sleep(timeout).await;
                    client.expire(&invocation_id);
                }
            })
            .abort_handle();

        let mut records = self.try_lock()?;
        if let Some(record) = records.get_mut(&invocation_id) {
            record.timer = Some(timer);
            record.cancel_listener = Some(listener);
        } else {
            drop(records);
            timer.abort();
            result.remove_cancel_listener(listener);
            return Err(
                CoreError::cancelled("invocation canceled before it was sent")
                    .with_invocation(&invocation_id),
            );
        }

        tracing::debug!(invocation_id = %invocation_id, timeout_ms = timeout.as_millis() as u64, "invocation registered");
        Ok(invocation_id)
    }

    /// Routes a server message to the callbacks registered for its id. Messages for ids
    /// that are no longer outstanding are dropped.
    pub fn handle_result(&self, message: ResultMessage) {
        match message {
            ResultMessage::Finished {
                invocation_id,
                result,
            } => match self.take(&invocation_id) {
                Some(record) => fire_isolated(|| record.result.finished(result)),
                None => dropped(&invocation_id, "finished"),
            },
            ResultMessage::Exception {
                invocation_id,
                error,
            } => match self.take(&invocation_id) {
                Some(record) => {
                    let error = error.with_invocation(&invocation_id);
                    fire_isolated(|| record.result.exception(error));
                }
                None => dropped(&invocation_id, "exception"),
            },
            ResultMessage::InterimResponse {
                invocation_id,
                response,
            } => {
                let progress = self
                    .lock()
                    .get(&invocation_id)
                    .map(|record| record.progress.clone());
                match progress {
                    Some(progress) => fire_isolated(|| progress.do_response(response)),
                    None => dropped(&invocation_id, "interim response"),
                }
            }
            ResultMessage::InterimRequest {
                invocation_id,
                request_id,
                request,
            } => {
                let target = self
                    .lock()
                    .get(&invocation_id)
                    .map(|record| (record.question.clone(), record.peer.clone()));
                let Some((question, peer)) = target else {
                    dropped(&invocation_id, "interim request");
                    return;
                };
                let reply: Arc<dyn InterimResponseCallback> = Arc::new(ServerReply {
                    invocation_id,
                    request_id,
                    peer,
                });
                fire_isolated(|| question.do_request(reply, request));
            }
        }
    }

    /// Abandons an invocation locally and tells the server to stop. No terminal outcome
    /// is delivered to the result callback; the canceling side already knows.
    pub fn cancel(&self, invocation_id: &InvocationId) -> bool {
        let Some(record) = self.take(invocation_id) else {
            return false;
        };
        tracing::debug!(invocation_id = %invocation_id, "invocation canceled by caller");
        self.notify_server_cancel(invocation_id.clone(), record.peer);
        true
    }

    /// Fails an outstanding invocation locally, e.g. when its request could not be sent.
    pub fn fail(&self, invocation_id: &InvocationId, error: CoreError) -> bool {
        let Some(record) = self.take(invocation_id) else {
            return false;
        };
        fire_isolated(|| record.result.exception(error));
        true
    }

    pub fn is_pending(&self, invocation_id: &InvocationId) -> bool {
        self.lock().contains_key(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pending(&self) -> Vec<InvocationInfo> {
        self.lock()
            .iter()
            .map(|(invocation_id, record)| InvocationInfo {
                invocation_id: invocation_id.clone(),
                server_id: record.peer.broker_id().clone(),
                timeout: record.timeout,
                created_at: record.created_at,
            })
            .collect()
    }

    fn expire(&self, invocation_id: &InvocationId) {
        let Some(mut record) = self.lock().remove(invocation_id) else {
            return;
        };
        // Running inside the timer itself; nothing left to abort.
        record.timer = None;
        record.release();

        tracing::debug!(
            invocation_id = %invocation_id,
            elapsed_ms = record.created_at.elapsed().map(|elapsed| elapsed.as_millis() as u64).unwrap_or_default(),
            "invocation timed out"
        );
        fire_isolated(|| record.result.timeout());
        self.notify_server_cancel(invocation_id.clone(), record.peer);
    }

    fn take(&self, invocation_id: &InvocationId) -> Option<InvocationRecord> {
        let mut record = self.lock().remove(invocation_id)?;
        record.release();
        Some(record)
    }

    fn notify_server_cancel(&self, invocation_id: InvocationId, peer: Peer) {
        self.inner.runtime.spawn_blocking(move || {
            let message = Message::Invocation(InvocationMessage::Cancel {
                invocation_id: invocation_id.clone(),
            });
            if let Err(error) = peer.send(message) {
                tracing::debug!(invocation_id = %invocation_id, %error, "cancel notification not delivered");
            }
        });
    }

    fn try_lock(&self) -> CoreResult<MutexGuard<'_, HashMap<InvocationId, InvocationRecord>>> {
        self.inner
            .records
            .lock()
            .map_err(|_| poisoned("invocation correlation"))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InvocationId, InvocationRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Answer path for one interim question, tagged with the server's request id.
struct ServerReply {
    invocation_id: InvocationId,
    request_id: RequestId,
    peer: Peer,
}

impl InterimResponseCallback for ServerReply {
    fn do_response(&self, response: Value) {
        let message = Message::Invocation(InvocationMessage::Response {
            invocation_id: self.invocation_id.clone(),
            request_id: self.request_id.clone(),
            response,
        });
        if let Err(error) = self.peer.send(message) {
            tracing::warn!(
                invocation_id = %self.invocation_id,
                request_id = %self.request_id,
                %error,
                "failed to send interim answer"
            );
        }
    }
}

fn dropped(invocation_id: &InvocationId, what: &str) {
    tracing::debug!(invocation_id = %invocation_id, message = what, "no outstanding invocation, message dropped");
}

pub(crate) fn timeout_error(invocation_id: Option<&InvocationId>, message: &str) -> CoreError {
    let error = CoreError::new(CoreErrorKind::Timeout, message);
    match invocation_id {
        Some(invocation_id) => error.with_invocation(invocation_id),
        None => error,
    }
}

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::broker::{BrokerRegistry, Peer};
use crate::execution::{
    ExecutionInvocationCallback, ExecutionProgressCallback, ExecutionQuestionCallback,
    ExecutionTask,
};
use crate::invocation::dispatch::DISCOVERY_METHOD;
use crate::invocation::{
    IgnoreProgress, IgnoreQuestions, InterimRequestCallback, InterimResponseCallback,
    InvocationCallback, InvocationClient, InvocationResultCallback, SyncInvocation,
};
use crate::models::error::poisoned;
use crate::models::{
    BrokerId, CoreError, CoreErrorKind, CoreResult, InvocationId, InvocationMessage, Message,
};

/// Where a named remote method lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteMethodDescriptor {
    pub method_name: String,
    pub server_id: BrokerId,
    pub timeout: Option<Duration>,
}

impl RemoteMethodDescriptor {
    pub fn new(method_name: impl Into<String>, server_id: BrokerId) -> Self {
        Self {
            method_name: method_name.into(),
            server_id,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client-side catalogue of remote method descriptors, keyed by method name.
#[derive(Clone, Default)]
pub struct RemoteMethodRegistry {
    methods: Arc<RwLock<HashMap<String, RemoteMethodDescriptor>>>,
}

impl RemoteMethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: RemoteMethodDescriptor) -> CoreResult<()> {
        if descriptor.method_name.trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "remote method name must not be empty",
            ));
        }
        if descriptor.server_id.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "remote method '{}' has an empty server id",
                    descriptor.method_name
                ),
            ));
        }
        self.methods
            .write()
            .map_err(|_| poisoned("remote method registry"))?
            .insert(descriptor.method_name.clone(), descriptor);
        Ok(())
    }

    pub fn method(&self, method_name: &str) -> Option<RemoteMethodDescriptor> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method_name)
            .cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Entry point for callers: hands out per-method services that look up, correlate and
/// send invocations.
#[derive(Clone)]
pub struct RemoteMethodClient {
    brokers: BrokerRegistry,
    methods: RemoteMethodRegistry,
    invocations: InvocationClient,
    runtime: Handle,
    default_timeout: Duration,
}

impl RemoteMethodClient {
    pub fn new(
        brokers: BrokerRegistry,
        methods: RemoteMethodRegistry,
        invocations: InvocationClient,
        runtime: Handle,
        default_timeout: Duration,
    ) -> Self {
        Self {
            brokers,
            methods,
            invocations,
            runtime,
            default_timeout,
        }
    }

    pub fn methods(&self) -> &RemoteMethodRegistry {
        &self.methods
    }

    pub fn invocations(&self) -> &InvocationClient {
        &self.invocations
    }

    /// The descriptor is resolved on every `invoke`, so methods registered later are
    /// still reachable through an existing service.
    pub fn method_service(
        &self,
        method_name: impl Into<String>,
        timeout: Option<Duration>,
    ) -> RemoteMethodService {
        RemoteMethodService {
            client: self.clone(),
            target: MethodTarget::Named(method_name.into()),
            timeout,
        }
    }

    /// A service bound to `descriptor` directly, bypassing the registry.
    pub fn bound_service(&self, descriptor: RemoteMethodDescriptor) -> RemoteMethodService {
        RemoteMethodService {
            client: self.clone(),
            target: MethodTarget::Bound(descriptor),
            timeout: None,
        }
    }

    /// Fetches the method list served by `server_id` and registers a descriptor for
    /// each entry. Blocks the calling thread for at most `wait`.
    pub fn discover(&self, server_id: &BrokerId, wait: Duration) -> CoreResult<Vec<String>> {
        let bridge = Arc::new(SyncInvocation::new());
        let service = self.bound_service(
            RemoteMethodDescriptor::new(DISCOVERY_METHOD, server_id.clone()).with_timeout(wait),
        );
        service.invoke(
            bridge.clone(),
            Arc::new(IgnoreProgress),
            Arc::new(IgnoreQuestions),
            Value::Null,
        );

        let listing = bridge.result_sync(Some(wait)).inspect_err(|_| bridge.cancel())?;
        let names: Vec<String> = serde_json::from_value(listing).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("malformed method listing from '{server_id}': {error}"),
            )
            .with_broker(server_id)
        })?;

        for name in &names {
            self.methods
                .register(RemoteMethodDescriptor::new(name.clone(), server_id.clone()))?;
        }
        tracing::info!(broker = %server_id, methods = names.len(), "remote methods discovered");
        Ok(names)
    }
}

#[derive(Clone, Debug)]
enum MethodTarget {
    Named(String),
    Bound(RemoteMethodDescriptor),
}

#[derive(Clone)]
pub struct RemoteMethodService {
    client: RemoteMethodClient,
    target: MethodTarget,
    timeout: Option<Duration>,
}

impl RemoteMethodService {
    pub fn method_name(&self) -> &str {
        match &self.target {
            MethodTarget::Named(name) => name,
            MethodTarget::Bound(descriptor) => &descriptor.method_name,
        }
    }

    /// Starts an invocation and returns its id, or `None` when nothing was sent. A lookup
    /// or registration failure has then already been delivered to `result`; a callback
    /// that was canceled beforehand gets no outcome.
    ///
    /// The send itself runs on the blocking pool, never on the calling thread.
    pub fn invoke(
        &self,
        result: Arc<dyn InvocationCallback>,
        progress: Arc<dyn InterimResponseCallback>,
        question: Arc<dyn InterimRequestCallback>,
        parameter: Value,
    ) -> Option<InvocationId> {
        let descriptor = match &self.target {
            MethodTarget::Bound(descriptor) => descriptor.clone(),
            MethodTarget::Named(name) => match self.client.methods.method(name) {
                Some(descriptor) => descriptor,
                None => {
                    result.exception(CoreError::new(
                        CoreErrorKind::MethodNotFound,
                        format!("no remote method '{name}' is registered"),
                    ));
                    return None;
                }
            },
        };

        let channel = match self.client.brokers.require_channel(&descriptor.server_id) {
            Ok(channel) => channel,
            Err(error) => {
                result.exception(error);
                return None;
            }
        };
        let peer = Peer::new(
            descriptor.server_id.clone(),
            channel,
            self.client.brokers.clone(),
        );

        let timeout = self
            .timeout
            .or(descriptor.timeout)
            .unwrap_or(self.client.default_timeout);
        let invocation_id = match self.client.invocations.register_invocation(
            result.clone(),
            progress,
            question,
            timeout,
            peer.clone(),
        ) {
            Ok(invocation_id) => invocation_id,
            Err(error) if error.is_cancelled() => {
                tracing::debug!(method = %descriptor.method_name, "invocation canceled before it was sent");
                return None;
            }
            Err(error) => {
                result.exception(error);
                return None;
            }
        };

        let message = Message::Invocation(InvocationMessage::Invoke {
            invocation_id: invocation_id.clone(),
            method: descriptor.method_name.clone(),
            parameter,
        });
        let invocations = self.client.invocations.clone();
        let sent_id = invocation_id.clone();
        self.client.runtime.spawn_blocking(move || {
            if let Err(error) = peer.send(message) {
                tracing::error!(
                    invocation_id = %sent_id,
                    method = %descriptor.method_name,
                    %error,
                    "failed to send invocation"
                );
                invocations.fail(&sent_id, error.with_invocation(&sent_id));
            }
        });

        Some(invocation_id)
    }

    /// Invokes with a local [`ExecutionTask`] standing in for the remote execution:
    /// server progress is mirrored onto `task`, server questions are asked on `task`, and
    /// canceling `task` cancels the invocation.
    pub fn invoke_with_execution(
        &self,
        task: &ExecutionTask,
        result: Arc<dyn InvocationResultCallback>,
        parameter: Value,
    ) -> Option<InvocationId> {
        self.invoke(
            Arc::new(ExecutionInvocationCallback::new(task.clone(), result)),
            Arc::new(ExecutionProgressCallback::new(task.clone())),
            Arc::new(ExecutionQuestionCallback::new(task.clone())),
            parameter,
        )
    }

    /// Blocking convenience over [`SyncInvocation`].
    pub fn invoke_sync(&self, parameter: Value, wait: Option<Duration>) -> CoreResult<Value> {
        let bridge = Arc::new(SyncInvocation::new());
        self.invoke(
            bridge.clone(),
            Arc::new(IgnoreProgress),
            Arc::new(IgnoreQuestions),
            parameter,
        );
        bridge.result_sync(wait)
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::broker::{BrokerRegistry, MessageChannel, MessageReceiver, Peer};
use crate::config::RemotingConfig;
use crate::invocation::{
    InvocationClient, MethodDispatcher, MethodHandler, RemoteMethodClient, RemoteMethodDescriptor,
    RemoteMethodRegistry, RemoteMethodService,
};
use crate::models::{BrokerId, CoreResult, Message};

/// One endpoint of the invocation protocol: it serves local methods and calls remote
/// ones through the brokers of its registry.
#[derive(Clone)]
pub struct Node {
    brokers: BrokerRegistry,
    dispatcher: MethodDispatcher,
    client: RemoteMethodClient,
    config: RemotingConfig,
}

impl Node {
    pub fn new(brokers: BrokerRegistry, config: RemotingConfig, runtime: Handle) -> Self {
        let client = RemoteMethodClient::new(
            brokers.clone(),
            RemoteMethodRegistry::new(),
            InvocationClient::new(runtime.clone()),
            runtime,
            config.default_timeout,
        );
        Self {
            brokers,
            dispatcher: MethodDispatcher::new(),
            client,
            config,
        }
    }

    pub fn brokers(&self) -> &BrokerRegistry {
        &self.brokers
    }

    pub fn dispatcher(&self) -> &MethodDispatcher {
        &self.dispatcher
    }

    pub fn client(&self) -> &RemoteMethodClient {
        &self.client
    }

    pub fn invocations(&self) -> &InvocationClient {
        self.client.invocations()
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    /// Installs this node as the receiver of `broker_id`: invocations arriving there are
    /// dispatched locally and results are routed to the pending invocations.
    pub fn listen(&self, broker_id: &BrokerId) -> CoreResult<()> {
        self.brokers.set_receiver(
            broker_id,
            Arc::new(NodeReceiver {
                broker_id: broker_id.clone(),
                brokers: self.brokers.clone(),
                dispatcher: self.dispatcher.clone(),
                invocations: self.client.invocations().clone(),
            }),
        )?;
        tracing::info!(broker = %broker_id, "node listening");
        Ok(())
    }

    pub fn register_method(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> CoreResult<()> {
        self.dispatcher.register_method(name, handler)
    }

    pub fn serve_discovery(&self) -> CoreResult<()> {
        self.dispatcher.serve_discovery()
    }

    pub fn register_remote_method(
        &self,
        name: impl Into<String>,
        server_id: &BrokerId,
    ) -> CoreResult<()> {
        self.client
            .methods()
            .register(RemoteMethodDescriptor::new(name, server_id.clone()))
    }

    pub fn method_service(&self, name: impl Into<String>) -> RemoteMethodService {
        self.client.method_service(name, None)
    }

    pub fn method_service_with_timeout(
        &self,
        name: impl Into<String>,
        timeout: Duration,
    ) -> RemoteMethodService {
        self.client.method_service(name, Some(timeout))
    }

    /// Blocking; see [`RemoteMethodClient::discover`].
    pub fn discover(&self, server_id: &BrokerId) -> CoreResult<Vec<String>> {
        self.client.discover(server_id, self.config.discovery_timeout)
    }
}

struct NodeReceiver {
    broker_id: BrokerId,
    brokers: BrokerRegistry,
    dispatcher: MethodDispatcher,
    invocations: InvocationClient,
}

impl MessageReceiver for NodeReceiver {
    fn on_message(&self, message: Message, reply: Arc<dyn MessageChannel>) {
        match message {
            Message::Invocation(invocation) => self.dispatcher.handle_invocation(
                invocation,
                Peer::new(self.broker_id.clone(), reply, self.brokers.clone()),
            ),
            Message::Result(result) => self.invocations.handle_result(result),
        }
    }
}

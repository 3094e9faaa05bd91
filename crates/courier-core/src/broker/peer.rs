use std::sync::Arc;

use crate::broker::{BrokerRegistry, MessageChannel};
use crate::models::{BrokerId, CoreResult, Message};

/// The far side of an invocation: a channel plus the broker it belongs to, so send
/// failures reach that broker's exception callbacks.
#[derive(Clone)]
pub struct Peer {
    broker_id: BrokerId,
    channel: Arc<dyn MessageChannel>,
    registry: BrokerRegistry,
}

impl Peer {
    pub fn new(
        broker_id: BrokerId,
        channel: Arc<dyn MessageChannel>,
        registry: BrokerRegistry,
    ) -> Self {
        Self {
            broker_id,
            channel,
            registry,
        }
    }

    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    pub fn send(&self, message: Message) -> CoreResult<()> {
        self.channel.send(message).map_err(|error| {
            let error = error.with_broker(&self.broker_id);
            self.registry.handle_exception(&self.broker_id, &error);
            error
        })
    }
}

pub mod in_process;
pub mod peer;
pub mod registry;

use std::sync::Arc;

use crate::models::{BrokerId, CoreError, CoreResult, Message};

pub use in_process::InProcessBroker;
pub use peer::Peer;
pub use registry::BrokerRegistry;

/// Outbound send path of a broker.
pub trait MessageChannel: Send + Sync {
    fn send(&self, message: Message) -> CoreResult<()>;
}

/// Inbound handler installed on a broker. `reply` sends back to whoever sent `message`.
pub trait MessageReceiver: Send + Sync {
    fn on_message(&self, message: Message, reply: Arc<dyn MessageChannel>);
}

pub trait ChannelBroker: Send + Sync {
    fn broker_id(&self) -> BrokerId;

    fn channel(&self) -> Option<Arc<dyn MessageChannel>>;
}

pub trait ReceiverBroker: Send + Sync {
    fn broker_id(&self) -> BrokerId;

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>);
}

pub trait ExceptionCallback: Send + Sync {
    fn exception(&self, broker: &BrokerId, error: &CoreError);
}

impl<F> ExceptionCallback for F
where
    F: Fn(&BrokerId, &CoreError) + Send + Sync,
{
    fn exception(&self, broker: &BrokerId, error: &CoreError) {
        self(broker, error)
    }
}

/// Plugin point through which brokers are discovered when a registry is first used.
pub trait BrokerProvider: Send + Sync {
    fn channel_brokers(&self) -> Vec<Arc<dyn ChannelBroker>> {
        Vec::new()
    }

    fn receiver_brokers(&self) -> Vec<Arc<dyn ReceiverBroker>> {
        Vec::new()
    }
}

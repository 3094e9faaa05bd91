use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::runtime::Handle;

use crate::broker::{ChannelBroker, MessageChannel, MessageReceiver, ReceiverBroker};
use crate::models::{BrokerId, CoreError, CoreErrorKind, CoreResult, Message};

type ReceiverSlot = RwLock<Option<Arc<dyn MessageReceiver>>>;

/// Loopback broker connecting two endpoints inside one process.
///
/// Every message is encoded to JSON and decoded again before delivery, and delivered
/// on the tokio blocking pool, so handlers observe the same asynchrony and payload
/// constraints as with a real transport.
pub struct InProcessBroker {
    id: BrokerId,
    peer_id: BrokerId,
    runtime: Handle,
    inbound: Arc<ReceiverSlot>,
    outbound: Arc<ReceiverSlot>,
    connected: Arc<AtomicBool>,
}

impl InProcessBroker {
    /// Creates two brokers where whatever one sends arrives at the other's receiver.
    pub fn pair(
        first: impl Into<BrokerId>,
        second: impl Into<BrokerId>,
        runtime: Handle,
    ) -> (Arc<Self>, Arc<Self>) {
        let first = first.into();
        let second = second.into();
        let first_inbound: Arc<ReceiverSlot> = Arc::new(RwLock::new(None));
        let second_inbound: Arc<ReceiverSlot> = Arc::new(RwLock::new(None));
        let connected = Arc::new(AtomicBool::new(true));

        let a = Arc::new(Self {
            id: first.clone(),
            peer_id: second.clone(),
            runtime: runtime.clone(),
            inbound: first_inbound.clone(),
            outbound: second_inbound.clone(),
            connected: connected.clone(),
        });
        let b = Arc::new(Self {
            id: second,
            peer_id: first,
            runtime,
            inbound: second_inbound,
            outbound: first_inbound,
            connected,
        });
        (a, b)
    }

    /// Simulates a broken link in both directions.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl ChannelBroker for InProcessBroker {
    fn broker_id(&self) -> BrokerId {
        self.id.clone()
    }

    fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        Some(Arc::new(InProcessChannel {
            target_id: self.peer_id.clone(),
            runtime: self.runtime.clone(),
            target: self.outbound.clone(),
            origin: self.inbound.clone(),
            origin_id: self.id.clone(),
            connected: self.connected.clone(),
        }))
    }
}

impl ReceiverBroker for InProcessBroker {
    fn broker_id(&self) -> BrokerId {
        self.id.clone()
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.inbound.write().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }
}

struct InProcessChannel {
    target_id: BrokerId,
    origin_id: BrokerId,
    runtime: Handle,
    target: Arc<ReceiverSlot>,
    origin: Arc<ReceiverSlot>,
    connected: Arc<AtomicBool>,
}

impl InProcessChannel {
    fn reversed(&self) -> Self {
        Self {
            target_id: self.origin_id.clone(),
            origin_id: self.target_id.clone(),
            runtime: self.runtime.clone(),
            target: self.origin.clone(),
            origin: self.target.clone(),
            connected: self.connected.clone(),
        }
    }
}

impl MessageChannel for InProcessChannel {
    fn send(&self, message: Message) -> CoreResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CoreError::new(
                CoreErrorKind::Transport,
                format!("in-process link to '{}' is disconnected", self.target_id),
            ));
        }

        let receiver = self
            .target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::Transport,
                    format!("broker '{}' has no receiver installed", self.target_id),
                )
            })?;

        let encoded = serde_json::to_vec(&message).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Transport,
                format!("failed to encode message: {error}"),
            )
        })?;
        let decoded: Message = serde_json::from_slice(&encoded).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Transport,
                format!("failed to decode message: {error}"),
            )
        })?;

        let reply: Arc<dyn MessageChannel> = Arc::new(self.reversed());
        self.runtime
            .spawn_blocking(move || receiver.on_message(decoded, reply));
        Ok(())
    }
}

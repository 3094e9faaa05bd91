use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::broker::{
    BrokerProvider, ChannelBroker, ExceptionCallback, MessageChannel, MessageReceiver,
    ReceiverBroker,
};
use crate::models::error::poisoned;
use crate::models::{BrokerId, CoreError, CoreErrorKind, CoreResult};

/// Maps broker ids to their send channel, receiver registration and exception
/// callbacks. One registry is built per process and handed to every component that
/// needs it; clones share state.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    providers: Vec<Arc<dyn BrokerProvider>>,
    discovery: OnceLock<()>,
    channels: RwLock<HashMap<BrokerId, Arc<dyn ChannelBroker>>>,
    receivers: RwLock<HashMap<BrokerId, Arc<dyn ReceiverBroker>>>,
    exception_callbacks: RwLock<HashMap<BrokerId, Vec<Arc<dyn ExceptionCallback>>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brokers advertised by `providers` are merged in lazily, once, on first use.
    pub fn with_providers(providers: impl IntoIterator<Item = Arc<dyn BrokerProvider>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                providers: providers.into_iter().collect(),
                ..RegistryInner::default()
            }),
        }
    }

    pub fn add_channel_broker(&self, broker: Arc<dyn ChannelBroker>) -> CoreResult<()> {
        self.ensure_discovered();
        insert_channel_broker(&self.inner, broker)
    }

    pub fn add_receiver_broker(&self, broker: Arc<dyn ReceiverBroker>) -> CoreResult<()> {
        self.ensure_discovered();
        insert_receiver_broker(&self.inner, broker)
    }

    /// Registers a broker in both roles.
    pub fn add_broker<B>(&self, broker: Arc<B>) -> CoreResult<()>
    where
        B: ChannelBroker + ReceiverBroker + 'static,
    {
        self.add_channel_broker(broker.clone())?;
        self.add_receiver_broker(broker)
    }

    /// `Ok(None)` means the id is known to nobody or its broker cannot send.
    pub fn channel(&self, broker_id: &BrokerId) -> CoreResult<Option<Arc<dyn MessageChannel>>> {
        validate_broker_id(broker_id)?;
        self.ensure_discovered();
        let channels = self
            .inner
            .channels
            .read()
            .map_err(|_| poisoned("broker channel"))?;
        Ok(channels.get(broker_id).and_then(|broker| broker.channel()))
    }

    pub fn require_channel(&self, broker_id: &BrokerId) -> CoreResult<Arc<dyn MessageChannel>> {
        self.channel(broker_id)?.ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::Transport,
                format!("no message channel is registered for broker '{broker_id}'"),
            )
            .with_broker(broker_id)
        })
    }

    pub fn set_receiver(
        &self,
        broker_id: &BrokerId,
        receiver: Arc<dyn MessageReceiver>,
    ) -> CoreResult<()> {
        validate_broker_id(broker_id)?;
        self.ensure_discovered();
        let broker = {
            let receivers = self
                .inner
                .receivers
                .read()
                .map_err(|_| poisoned("broker receiver"))?;
            receivers.get(broker_id).cloned()
        };

        let broker = broker.ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("no receiver broker is registered for broker '{broker_id}'"),
            )
            .with_broker(broker_id)
        })?;
        broker.set_receiver(receiver);
        Ok(())
    }

    pub fn add_exception_callback(
        &self,
        broker_id: &BrokerId,
        callback: Arc<dyn ExceptionCallback>,
    ) -> CoreResult<()> {
        validate_broker_id(broker_id)?;
        let mut callbacks = self
            .inner
            .exception_callbacks
            .write()
            .map_err(|_| poisoned("broker exception callback"))?;
        callbacks.entry(broker_id.clone()).or_default().push(callback);
        Ok(())
    }

    /// Fans `error` out to every callback registered for `broker_id`, or logs it when
    /// there are none.
    pub fn handle_exception(&self, broker_id: &BrokerId, error: &CoreError) {
        let callbacks = self
            .inner
            .exception_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker_id)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            tracing::error!(
                broker = %broker_id,
                kind = ?error.kind,
                message = %error.message,
                "unhandled broker exception"
            );
            return;
        }

        for callback in callbacks {
            crate::execution::listener::fire_isolated(|| callback.exception(broker_id, error));
        }
    }

    pub fn broker_ids(&self) -> Vec<BrokerId> {
        self.ensure_discovered();
        let mut ids: Vec<BrokerId> = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .chain(
                self.inner
                    .receivers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys(),
            )
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn ensure_discovered(&self) {
        let inner = &self.inner;
        inner.discovery.get_or_init(|| {
            for provider in &inner.providers {
                for broker in provider.channel_brokers() {
                    if let Err(error) = insert_channel_broker(inner, broker) {
                        tracing::error!(%error, "discovered channel broker rejected");
                    }
                }
                for broker in provider.receiver_brokers() {
                    if let Err(error) = insert_receiver_broker(inner, broker) {
                        tracing::error!(%error, "discovered receiver broker rejected");
                    }
                }
            }
            tracing::debug!(providers = inner.providers.len(), "broker discovery complete");
        });
    }
}

fn insert_channel_broker(inner: &RegistryInner, broker: Arc<dyn ChannelBroker>) -> CoreResult<()> {
    let broker_id = broker.broker_id();
    validate_broker_id(&broker_id)?;
    inner
        .channels
        .write()
        .map_err(|_| poisoned("broker channel"))?
        .insert(broker_id, broker);
    Ok(())
}

fn insert_receiver_broker(
    inner: &RegistryInner,
    broker: Arc<dyn ReceiverBroker>,
) -> CoreResult<()> {
    let broker_id = broker.broker_id();
    validate_broker_id(&broker_id)?;
    inner
        .receivers
        .write()
        .map_err(|_| poisoned("broker receiver"))?
        .insert(broker_id, broker);
    Ok(())
}

fn validate_broker_id(broker_id: &BrokerId) -> CoreResult<()> {
    if broker_id.is_empty() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "broker id must not be empty",
        ));
    }
    Ok(())
}

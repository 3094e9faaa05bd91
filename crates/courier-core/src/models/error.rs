use serde::{Deserialize, Serialize};

use crate::models::{BrokerId, InvocationId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CoreErrorKind {
    MethodNotFound,
    Cancelled,
    Timeout,
    Remote,
    Transport,
    InvalidInput,
    InvalidState,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub invocation: Option<InvocationId>,
    pub broker: Option<BrokerId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            invocation: None,
            broker: None,
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Cancelled, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == CoreErrorKind::Cancelled
    }

    pub fn with_invocation(mut self, invocation: &InvocationId) -> Self {
        self.invocation.get_or_insert_with(|| invocation.clone());
        self
    }

    pub fn with_broker(mut self, broker: &BrokerId) -> Self {
        self.broker.get_or_insert_with(|| broker.clone());
        self
    }
}

pub(crate) fn poisoned(what: &str) -> CoreError {
    CoreError::new(CoreErrorKind::Internal, format!("{what} mutex poisoned"))
}

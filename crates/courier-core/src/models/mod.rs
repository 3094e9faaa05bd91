pub mod error;
pub mod ids;
pub mod message;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use ids::{BrokerId, InvocationId, RequestId};
pub use message::{InvocationMessage, Message, ResultMessage};

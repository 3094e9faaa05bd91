pub mod callback;
pub mod cancel_registry;
pub mod client;
pub mod dispatch;
pub mod remote_method;
pub mod sync_bridge;

pub use callback::{
    CancelSource, IgnoreProgress, IgnoreQuestions, InterimRequestCallback,
    InterimResponseCallback, InvocationCallback, InvocationResultCallback,
};
pub use cancel_registry::CancelRegistry;
pub use client::{InvocationClient, InvocationInfo};
pub use dispatch::{DISCOVERY_METHOD, ExecutionMethod, MethodDispatcher, MethodHandler, SyncMethod};
pub use remote_method::{
    RemoteMethodClient, RemoteMethodDescriptor, RemoteMethodRegistry, RemoteMethodService,
};
pub use sync_bridge::SyncInvocation;

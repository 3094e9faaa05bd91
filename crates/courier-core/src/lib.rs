pub mod broker;
pub mod config;
pub mod execution;
pub mod invocation;
pub mod logging;
pub mod models;
pub mod node;

pub use config::RemotingConfig;
pub use node::Node;

//! `nodes` crate: the `ExecutableNode` trait and built-in node implementations.
//!
//! Every plugin kind, built-in or sandboxed, implements
//! [`ExecutableNode`]. The engine crate dispatches execution through this
//! trait object; IF nodes are evaluated by the engine itself.

pub mod api_proxy;
pub mod cache;
pub mod data_aggregator;
pub mod delay;
pub mod error;
pub mod mock;
pub mod sandbox;
pub mod ssrf;
pub mod text_transform;
pub mod traits;
pub mod value;

pub use api_proxy::ApiProxyNode;
pub use cache::{KvCache, MemoryCache};
pub use data_aggregator::DataAggregatorNode;
pub use delay::DelayNode;
pub use error::NodeError;
pub use sandbox::SandboxNode;
pub use text_transform::TextTransformNode;
pub use traits::{ExecutableNode, ExecutionContext, NodeOutput};

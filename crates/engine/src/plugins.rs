//! Dispatch from [`NodeKind`] to the plugin that executes it.
//!
//! One field per executable kind keeps dispatch exhaustive: adding a
//! `NodeKind` variant fails to compile until it is routed here.

use std::sync::Arc;

use nodes::{
    ApiProxyNode, DataAggregatorNode, DelayNode, ExecutableNode, KvCache, SandboxNode,
    TextTransformNode,
};

use crate::{EngineError, config::EngineConfig, models::NodeKind};

#[derive(Clone)]
pub struct PluginSet {
    pub text_transform: Arc<dyn ExecutableNode>,
    pub api_proxy: Arc<dyn ExecutableNode>,
    pub data_aggregator: Arc<dyn ExecutableNode>,
    pub delay: Arc<dyn ExecutableNode>,
    pub custom: Arc<dyn ExecutableNode>,
}

impl PluginSet {
    /// The built-in plugins, wired from `config`.
    pub fn builtin(config: &EngineConfig, cache: Arc<dyn KvCache>) -> Result<Self, EngineError> {
        let api_proxy = ApiProxyNode::new(cache, config.api_cache_ttl, config.http_timeout)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            text_transform: Arc::new(TextTransformNode),
            api_proxy: Arc::new(api_proxy),
            data_aggregator: Arc::new(DataAggregatorNode),
            delay: Arc::new(DelayNode::new(config.inline_delay_threshold)),
            custom: Arc::new(SandboxNode::new(config.sandbox_timeout)),
        })
    }

    /// Route every kind to the same node. Handy with `MockNode` in tests.
    pub fn uniform(node: Arc<dyn ExecutableNode>) -> Self {
        Self {
            text_transform: node.clone(),
            api_proxy: node.clone(),
            data_aggregator: node.clone(),
            delay: node.clone(),
            custom: node,
        }
    }

    /// The plugin for `kind`; `None` for IF, which the engine evaluates itself.
    pub fn handler(&self, kind: NodeKind) -> Option<&Arc<dyn ExecutableNode>> {
        match kind {
            NodeKind::TextTransform => Some(&self.text_transform),
            NodeKind::ApiProxy => Some(&self.api_proxy),
            NodeKind::DataAggregator => Some(&self.data_aggregator),
            NodeKind::Delay => Some(&self.delay),
            NodeKind::Custom => Some(&self.custom),
            NodeKind::If => None,
        }
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::factory::MessageFactory;
use crate::hooks::GraphCache;

/// Shared context a subsystem carries through build and dispatch: the
/// runtime configuration map, the message factory, and the build-graph
/// cache.
///
/// Cloning shares all three — children created from a parent's context see
/// the same configuration and reuse the same resolved build plans.
#[derive(Clone)]
pub struct SubsystemContext {
    config: Arc<RwLock<BTreeMap<String, Value>>>,
    factory: Arc<MessageFactory>,
    graph_cache: Arc<GraphCache>,
}

impl SubsystemContext {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(BTreeMap::new())),
            factory: Arc::new(MessageFactory::new()),
            graph_cache: Arc::new(GraphCache::new()),
        }
    }

    pub fn with_config(config: BTreeMap<String, Value>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            ..Self::new()
        }
    }

    pub fn factory(&self) -> Arc<MessageFactory> {
        Arc::clone(&self.factory)
    }

    pub fn graph_cache(&self) -> &GraphCache {
        &self.graph_cache
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config
            .read()
            .expect("context config poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: Value) {
        self.config
            .write()
            .expect("context config poisoned")
            .insert(key.into(), value);
    }
}

impl Default for SubsystemContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubsystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .config
            .read()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("SubsystemContext")
            .field("config_keys", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_config() {
        let ctx = SubsystemContext::new();
        let child = ctx.clone();
        ctx.set_config("slice_ms", json!(25));
        assert_eq!(child.config_value("slice_ms"), Some(json!(25)));
    }

    #[test]
    fn missing_key_is_none() {
        let ctx = SubsystemContext::new();
        assert!(ctx.config_value("absent").is_none());
    }
}

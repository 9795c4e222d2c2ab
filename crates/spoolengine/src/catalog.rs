use spoolcore::{EngineError, Handler, HandlerDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of action kinds the engine can drive. Pure lookup plus
/// contract declaration; execution happens in the scheduler.
#[derive(Default)]
pub struct HandlerCatalog {
    entries: HashMap<String, CatalogEntry>,
}

struct CatalogEntry {
    descriptor: HandlerDescriptor,
    handler: Arc<dyn Handler>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a handler under its descriptor's action kind.
    pub fn register(&mut self, descriptor: HandlerDescriptor, handler: Arc<dyn Handler>) {
        tracing::info!(action_kind = %descriptor.action_kind, "registering handler");
        self.entries.insert(
            descriptor.action_kind.clone(),
            CatalogEntry {
                descriptor,
                handler,
            },
        );
    }

    pub fn get(
        &self,
        action_kind: &str,
    ) -> Result<(&HandlerDescriptor, Arc<dyn Handler>), EngineError> {
        self.entries
            .get(action_kind)
            .map(|e| (&e.descriptor, Arc::clone(&e.handler)))
            .ok_or_else(|| EngineError::UnknownActionKind(action_kind.to_string()))
    }

    pub fn descriptor(&self, action_kind: &str) -> Option<&HandlerDescriptor> {
        self.entries.get(action_kind).map(|e| &e.descriptor)
    }

    pub fn action_kinds(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{builtin, ToolAdapter};

/// Name-indexed set of tool adapters used to build task graphs.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry holding every built-in adapter.
    pub fn with_builtin(tool_paths: &HashMap<String, PathBuf>) -> Self {
        let mut registry = Self::new();
        for adapter in builtin::default_adapters(tool_paths) {
            registry.register(adapter);
        }
        registry
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.insert(adapter.name().to_string(), adapter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Sorted names of every registered adapter
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{builtin::NaabuAdapter, ToolKind, NAABU, NUCLEI};

    #[test]
    fn test_registry_creation() {
        let registry = AdapterRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(NAABU).is_none());
    }

    #[test]
    fn test_builtin_loading() {
        let registry = AdapterRegistry::with_builtin(&HashMap::new());
        assert_eq!(registry.len(), 7);
        assert_eq!(
            registry.list(),
            vec!["dnsx", "httpx", "katana", "naabu", "nuclei", "subfinder", "uncover"]
        );

        let nuclei = registry.get(NUCLEI).unwrap();
        assert_eq!(nuclei.kind(), ToolKind::VulnMatch);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = AdapterRegistry::with_builtin(&HashMap::new());
        let previous = registry.register(Arc::new(NaabuAdapter::new("/usr/local/bin/naabu")));
        assert!(previous.is_some());
        assert_eq!(registry.len(), 7);
    }
}

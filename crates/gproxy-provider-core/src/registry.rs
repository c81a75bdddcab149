use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::ProviderExecutor;

/// Executors keyed by provider identifier (spec §4.G: "Registered executors
/// keyed by `Auth.Provider`").
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.executors
            .insert(executor.identifier().to_string(), executor);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.executors.contains_key(provider)
    }
}

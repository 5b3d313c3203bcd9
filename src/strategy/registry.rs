//! Named strategy lookup for hosts

use super::StrategyModule;
use crate::error::{EngineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a fresh strategy module for one run
pub type StrategyFactory = Arc<dyn Fn() -> StrategyModule + Send + Sync>;

/// Name to constructor map through which a host resolves `run.strategy`
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> StrategyModule + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(EngineError::InvalidConfig(format!(
                "strategy {name} already registered"
            )));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<StrategyModule> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown strategy {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

//! Strategy registry keyed by configuration tag.
//!
//! Registries are plain values built and passed in by whoever assembles the
//! runtime; there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use loopwright_config::CompactionConfig;
use loopwright_core::error::{Error, Result};
use loopwright_core::step::StepExecutor;
use loopwright_core::token::TokenEstimator;

use super::{CompactionStrategy, NoopStrategy, OldestEvictionStrategy, ReactiveSummaryStrategy};
use crate::context::token::HeuristicEstimator;

/// Collaborators a strategy constructor may use.
#[derive(Clone)]
pub struct StrategyDeps {
    pub config: CompactionConfig,
    /// Model used to write summaries
    pub summarizer: Option<Arc<dyn StepExecutor>>,
    pub estimator: Arc<dyn TokenEstimator>,
}

impl StrategyDeps {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            summarizer: None,
            estimator: Arc::new(HeuristicEstimator),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn StepExecutor>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }
}

pub type StrategyFactory =
    Arc<dyn Fn(&StrategyDeps) -> Arc<dyn CompactionStrategy> + Send + Sync>;

#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `reactive-summary`, `oldest-eviction` and `noop`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, StrategyFactory); 3] = [
            (
                "reactive-summary",
                Arc::new(|deps: &StrategyDeps| {
                    let strategy = ReactiveSummaryStrategy::new(deps.config.clone());
                    let strategy = match &deps.summarizer {
                        Some(summarizer) => strategy.with_summarizer(summarizer.clone()),
                        None => strategy,
                    };
                    Arc::new(strategy) as Arc<dyn CompactionStrategy>
                }),
            ),
            (
                "oldest-eviction",
                Arc::new(|deps: &StrategyDeps| {
                    Arc::new(OldestEvictionStrategy::new(&deps.config, deps.estimator.clone()))
                        as Arc<dyn CompactionStrategy>
                }),
            ),
            (
                "noop",
                Arc::new(|_: &StrategyDeps| Arc::new(NoopStrategy) as Arc<dyn CompactionStrategy>),
            ),
        ];
        for (tag, factory) in builtins {
            registry.factories.insert(tag.to_string(), factory);
        }
        registry
    }

    /// Register a constructor. A tag can only be registered once.
    pub fn register(&mut self, tag: impl Into<String>, factory: StrategyFactory) -> Result<()> {
        let tag = tag.into();
        if self.factories.contains_key(&tag) {
            return Err(Error::Config {
                message: format!("compaction strategy '{tag}' is already registered"),
            });
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    pub fn create(&self, tag: &str, deps: &StrategyDeps) -> Result<Arc<dyn CompactionStrategy>> {
        self.factories
            .get(tag)
            .map(|factory| factory(deps))
            .ok_or_else(|| Error::UnknownStrategy(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

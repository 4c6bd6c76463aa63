//! The extraction seam between the engine and site-specific DOM logic
//!
//! The engine only ever sees the [`PageExtractor`] capability set: page-kind
//! checks and a filtered extraction yielding follow-up links and structured
//! records. Concrete per-locale selector logic lives behind the registered
//! factories and is out of scope here; [`html`] provides the shared scraper
//! helpers those implementations are built on.

pub mod generic;
pub mod html;

use crate::{CrawlError, FlowError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Filters applied during extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractFilters {
    /// Lowercased category names to descend into; empty means all.
    pub categories: Vec<String>,
    /// The page's container was already expanded this run: harvest records
    /// but do not fan out into its children again.
    pub skip_children: bool,
}

/// Extraction result: follow-up links plus structured records.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub links: Vec<String>,
    pub records: Vec<Value>,
}

/// Capability set a fetched page exposes to the engine.
pub trait PageExtractor: Send {
    /// Is this the kind of page the pipeline is after?
    fn is_target_page(&self) -> bool;

    /// Is this an anti-bot challenge page?
    fn is_challenge_page(&self) -> bool;

    /// Has the origin blocked this network identity outright?
    fn is_blocked_page(&self) -> bool {
        false
    }

    /// Extracts follow-up links and records, honoring the filters.
    fn extract(&self, filters: &ExtractFilters) -> Result<Extraction, String>;
}

/// Builds an extractor from a fetched page body.
pub type ExtractorFactory = Arc<dyn Fn(&str) -> Box<dyn PageExtractor> + Send + Sync>;

/// Platform-name dispatch for extractor factories, fixed at startup.
#[derive(Default)]
pub struct ExtractorRegistry {
    factories: HashMap<String, ExtractorFactory>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        ExtractorRegistry::default()
    }

    pub fn register(&mut self, platform: impl Into<String>, factory: ExtractorFactory) {
        self.factories.insert(platform.into(), factory);
    }

    /// Looks a platform up at wiring time.
    pub fn get(&self, platform: &str) -> Result<ExtractorFactory, FlowError> {
        self.factories
            .get(platform)
            .cloned()
            .ok_or_else(|| FlowError::UnknownPlatform(platform.to_string()))
    }

    /// Looks a platform up from inside a handler, where an unknown platform
    /// is a task-protocol violation rather than a wiring error.
    pub fn get_for_task(&self, platform: &str) -> Result<ExtractorFactory, CrawlError> {
        self.factories
            .get(platform)
            .cloned()
            .ok_or_else(|| CrawlError::Protocol(format!("unknown platform: {}", platform)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullExtractor;

    impl PageExtractor for NullExtractor {
        fn is_target_page(&self) -> bool {
            true
        }
        fn is_challenge_page(&self) -> bool {
            false
        }
        fn extract(&self, _filters: &ExtractFilters) -> Result<Extraction, String> {
            Ok(Extraction::default())
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = ExtractorRegistry::new();
        registry.register("shop-us", Arc::new(|_html| Box::new(NullExtractor)));

        assert!(registry.get("shop-us").is_ok());
        assert!(matches!(
            registry.get("shop-xx"),
            Err(FlowError::UnknownPlatform(_))
        ));
        assert!(matches!(
            registry.get_for_task("shop-xx"),
            Err(CrawlError::Protocol(_))
        ));
    }
}

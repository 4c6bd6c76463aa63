//! Config-driven listing extractor
//!
//! Site modules normally ship hand-tuned extractors per locale. This generic
//! one covers the common listing shape from configuration alone: a target
//! selector, link selectors for fan-out, and a record container whose key
//! attribute carries the natural key. It is what the shipped pipelines run
//! with when no dedicated extractor is registered for a platform.

use crate::config::{PlatformConfig, SelectorConfig};
use crate::extract::{html, ExtractFilters, Extraction, ExtractorFactory, PageExtractor};
use scraper::{Html, Selector};
use serde_json::json;
use std::sync::Arc;
use url::Url;

pub struct SelectorExtractor {
    body: String,
    platform: String,
    base_url: Option<Url>,
    selectors: SelectorConfig,
}

impl PageExtractor for SelectorExtractor {
    fn is_target_page(&self) -> bool {
        let document = Html::parse_document(&self.body);
        Selector::parse(&self.selectors.target)
            .map(|s| document.select(&s).next().is_some())
            .unwrap_or(false)
    }

    fn is_challenge_page(&self) -> bool {
        let document = Html::parse_document(&self.body);
        html::has_challenge_form(&document)
    }

    fn extract(&self, filters: &ExtractFilters) -> Result<Extraction, String> {
        let document = Html::parse_document(&self.body);
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| format!("platform {} has no base-url", self.platform))?;

        let mut links = Vec::new();
        if !filters.skip_children {
            for selector in &self.selectors.links {
                links.extend(self.filtered_links(&document, selector, base, &filters.categories)?);
            }
        }

        let mut records = Vec::new();
        if let Some(record) = &self.selectors.record {
            let selector = Selector::parse(&record.selector)
                .map_err(|e| format!("bad record selector: {}", e))?;
            for element in document.select(&selector) {
                if let Some(key) = element.value().attr(record.key_attr.as_str()) {
                    records.push(json!({
                        "platform": self.platform,
                        "key": key,
                    }));
                }
            }
        }

        Ok(Extraction { links, records })
    }
}

impl SelectorExtractor {
    /// Links under one selector whose anchor text passes the category filter.
    fn filtered_links(
        &self,
        document: &Html,
        selector: &str,
        base: &Url,
        categories: &[String],
    ) -> Result<Vec<String>, String> {
        let selector = Selector::parse(selector).map_err(|e| format!("bad link selector: {}", e))?;
        let mut links = Vec::new();
        for element in document.select(&selector) {
            if !categories.is_empty() {
                let text = element.text().collect::<String>().to_lowercase();
                if !categories.iter().any(|c| text.contains(c)) {
                    continue;
                }
            }
            if let Some(href) = element.value().attr("href") {
                if let Ok(resolved) = base.join(href.trim()) {
                    links.push(resolved.to_string());
                }
            }
        }
        Ok(links)
    }
}

/// Builds a factory for one platform from its configuration, or None when the
/// platform declares no selector set.
pub fn factory_for(platform: &str, config: &PlatformConfig) -> Option<ExtractorFactory> {
    let selectors = config.selectors.clone()?;
    let base_url = config.base_url.as_ref().and_then(|u| Url::parse(u).ok());
    let platform = platform.to_string();
    Some(Arc::new(move |body: &str| {
        Box::new(SelectorExtractor {
            body: body.to_string(),
            platform: platform.clone(),
            base_url: base_url.clone(),
            selectors: selectors.clone(),
        })
    }))
}

//! Blog type to crawler constructor mapping.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::blog::HIDDEN_BLOG_TYPE;
use crate::crawler::{Crawler, CrawlerDeps};

/// Builds a crawler from its collaborators.
pub type CrawlerFactory = fn(CrawlerDeps) -> Crawler;

/// Registry lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No constructor is registered for the blog type.
    #[error("unknown blog type '{blog_type}'")]
    UnknownBlogType {
        /// The requested type.
        blog_type: String,
    },
}

/// Explicit map of blog types to crawler constructors, filled at startup.
#[derive(Debug, Clone, Default)]
pub struct CrawlerRegistry {
    factories: BTreeMap<String, CrawlerFactory>,
}

impl CrawlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving the hidden-blog crawler.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(HIDDEN_BLOG_TYPE, Crawler::new);
        registry
    }

    /// Registers `factory` for `blog_type`, returning the one it replaced.
    pub fn register(
        &mut self,
        blog_type: impl Into<String>,
        factory: CrawlerFactory,
    ) -> Option<CrawlerFactory> {
        self.factories.insert(blog_type.into(), factory)
    }

    /// Whether `blog_type` can be crawled.
    #[must_use]
    pub fn supports(&self, blog_type: &str) -> bool {
        self.factories.contains_key(blog_type)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn blog_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds the crawler for `blog_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBlogType`] when nothing is registered.
    pub fn create(&self, blog_type: &str, deps: CrawlerDeps) -> Result<Crawler, RegistryError> {
        let factory = self
            .factories
            .get(blog_type)
            .ok_or_else(|| RegistryError::UnknownBlogType {
                blog_type: blog_type.to_string(),
            })?;
        Ok(factory(deps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_serve_hidden_blogs() {
        let registry = CrawlerRegistry::with_defaults();
        assert!(registry.supports(HIDDEN_BLOG_TYPE));
        assert!(!registry.supports("tumblr_search"));
        assert_eq!(registry.blog_types(), vec![HIDDEN_BLOG_TYPE]);
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = CrawlerRegistry::new();
        assert!(registry.register("a", Crawler::new).is_none());
        assert!(registry.register("a", Crawler::new).is_some());
        assert_eq!(registry.blog_types(), vec!["a"]);
    }
}

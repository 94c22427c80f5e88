//! Cached AI text generation
//!
//! The text-generation backend is an external collaborator. Responses are
//! cached by prompt hash and failures are remembered briefly so a flaky
//! backend is not hammered by repeated identical prompts.

use crate::cache::{prompt_key, CacheError, CacheOptions, TieredCache};
use async_trait::async_trait;
use std::sync::Arc;

/// External text-generation backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, String>;
}

/// `TextGenerator` front with response caching
#[derive(Clone)]
pub struct CachedGenerator {
    inner: Arc<dyn TextGenerator>,
    cache: TieredCache,
    namespace: String,
    options: CacheOptions,
}

impl CachedGenerator {
    /// Responses live for a day unless `with_options` overrides it
    pub fn new(inner: Arc<dyn TextGenerator>, cache: TieredCache, namespace: &str) -> Self {
        Self {
            inner,
            cache,
            namespace: namespace.to_string(),
            options: CacheOptions::default().ttl_minutes(24 * 60).cache_errors(),
        }
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = CacheOptions {
            cache_errors: true,
            ..options
        };
        self
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, CacheError> {
        let key = prompt_key(&self.namespace, prompt);
        let inner = Arc::clone(&self.inner);
        let prompt = prompt.to_string();

        self.cache
            .get_data(&key, || async move { inner.generate(&prompt).await }, &self.options)
            .await
    }

    /// Drop every cached response in this namespace
    pub async fn forget_all(&self) -> Result<usize, CacheError> {
        self.cache.invalidate_by_prefix(&format!("{}:", self.namespace)).await
    }
}

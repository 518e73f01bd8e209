//! Multi-provider upstream layer: registry, pacing, adapters and the
//! fallback dispatcher that ties them together.
//!
//! Every outbound call is gated by the [`RateLimiter`], attributed to a
//! named [`registry::ProviderEntry`], and routed through one of the trait
//! seams below so tests can substitute providers freely.

pub mod adapters;
pub mod dispatch;
pub mod rate_limit;
pub mod registry;

pub use dispatch::Dispatcher;
pub use rate_limit::{Permit, RateLimiter};
pub use registry::{ProviderEntry, ProviderRegistry, ProviderState};

use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The category a provider belongs to; the dispatcher selects within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    Llm,
    Search,
    Social,
    Extractor,
}

impl std::fmt::Display for ProviderClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Llm => "llm",
            Self::Search => "search",
            Self::Social => "social",
            Self::Extractor => "extractor",
        };
        f.write_str(s)
    }
}

/// One LLM generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub system: Option<String>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 4096,
            system: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A successful LLM generation, attributed to the provider that served it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One web-search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: 10,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

/// One result row from a search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Which provider produced this hit
    pub source: String,
}

/// One social-media search request.
#[derive(Debug, Clone)]
pub struct SocialRequest {
    pub query: String,
    pub max_results: usize,
}

impl SocialRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: 20,
        }
    }
}

/// One post returned by a social search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialPost {
    pub platform: String,
    pub author: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement: Option<u64>,
}

/// Seam for LLM inference endpoints. Implementations make exactly one
/// attempt; rotation and retries belong to the dispatcher.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError>;
}

/// Seam for web-search engines.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ProviderError>;
}

/// Seam for social-media search APIs.
#[async_trait]
pub trait SocialProvider: Send + Sync {
    async fn search(&self, request: &SocialRequest) -> Result<Vec<SocialPost>, ProviderError>;
}

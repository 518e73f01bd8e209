//! Single-attempt adapters for the upstream services.
//!
//! Each adapter translates one request into one HTTP call and classifies
//! the outcome into [`ProviderError`]. No adapter sleeps or retries; the
//! dispatcher owns rotation, pacing and deadlines.

use crate::config::{AdapterKind, CredentialEntry};
use crate::errors::ProviderError;
use crate::provider::{
    LlmProvider, LlmRequest, SearchHit, SearchProvider, SearchRequest, SocialPost,
    SocialProvider, SocialRequest,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GOOGLE_SEARCH_API_BASE: &str = "https://www.googleapis.com/customsearch/v1";
const SERPER_API_URL: &str = "https://google.serper.dev/search";
const SUPADATA_DEFAULT_BASE: &str = "https://api.supadata.ai/v1";

/// Build the LLM adapter for a credential entry.
pub fn llm_adapter(entry: &CredentialEntry, client: &reqwest::Client) -> Arc<dyn LlmProvider> {
    match entry.adapter {
        AdapterKind::Gemini => Arc::new(GeminiChat {
            client: client.clone(),
            api_key: entry.api_key.clone(),
            model: entry.model.clone().unwrap_or_else(|| "gemini-2.0-flash".to_string()),
        }),
        _ => Arc::new(OpenAiCompatibleChat {
            client: client.clone(),
            base_url: entry
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: entry.api_key.clone(),
            model: entry.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
        }),
    }
}

/// Build the search adapter for a credential entry.
pub fn search_adapter(entry: &CredentialEntry, client: &reqwest::Client) -> Arc<dyn SearchProvider> {
    match entry.adapter {
        AdapterKind::Serper => Arc::new(SerperSearch {
            client: client.clone(),
            api_key: entry.api_key.clone(),
            name: entry.name.clone(),
        }),
        _ => Arc::new(GoogleCustomSearch {
            client: client.clone(),
            api_key: entry.api_key.clone(),
            engine_id: entry.model.clone().unwrap_or_default(),
            name: entry.name.clone(),
        }),
    }
}

/// Build the social adapter for a credential entry.
pub fn social_adapter(entry: &CredentialEntry, client: &reqwest::Client) -> Arc<dyn SocialProvider> {
    Arc::new(SupadataSocial {
        client: client.clone(),
        api_key: entry.api_key.clone(),
        base_url: entry
            .endpoint
            .clone()
            .unwrap_or_else(|| SUPADATA_DEFAULT_BASE.to_string()),
    })
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { seconds: 0 }
    } else {
        ProviderError::Server {
            message: err.to_string(),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(ProviderError::from_status(status.as_u16(), excerpt))
}

/// Chat-completions adapter covering OpenAI, Groq and DeepSeek endpoints.
pub struct OpenAiCompatibleChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleChat {
    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": request.max_tokens,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol { message: e.to_string() })?;

        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(text)
    }
}

/// Google Gemini generateContent adapter.
pub struct GeminiChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[async_trait]
impl LlmProvider for GeminiChat {
    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        let mut parts = Vec::new();
        if let Some(system) = &request.system {
            parts.push(json!({"text": system}));
        }
        parts.push(json!({"text": request.prompt}));

        let url = format!("{GEMINI_API_BASE}/{}:generateContent", self.model);
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({
                "contents": [{"parts": parts}],
                "generationConfig": {"maxOutputTokens": request.max_tokens},
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol { message: e.to_string() })?;

        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(text)
    }
}

/// Google Custom Search JSON API adapter. One instance per rotating key.
pub struct GoogleCustomSearch {
    client: reqwest::Client,
    api_key: String,
    engine_id: String,
    name: String,
}

#[async_trait]
impl SearchProvider for GoogleCustomSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ProviderError> {
        let num = request.max_results.clamp(1, 10).to_string();
        let response = self
            .client
            .get(GOOGLE_SEARCH_API_BASE)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", request.query.as_str()),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol { message: e.to_string() })?;

        let hits = collect_hits(&body["items"], "title", "link", "snippet", &self.name);
        if hits.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(hits)
    }
}

/// Serper.dev search adapter.
pub struct SerperSearch {
    client: reqwest::Client,
    api_key: String,
    name: String,
}

#[async_trait]
impl SearchProvider for SerperSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ProviderError> {
        let response = self
            .client
            .post(SERPER_API_URL)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({
                "q": request.query,
                "num": request.max_results,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol { message: e.to_string() })?;

        let hits = collect_hits(&body["organic"], "title", "link", "snippet", &self.name);
        if hits.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(hits)
    }
}

fn collect_hits(items: &Value, title: &str, url: &str, snippet: &str, source: &str) -> Vec<SearchHit> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let url = item[url].as_str()?;
            Some(SearchHit {
                title: item[title].as_str().unwrap_or_default().to_string(),
                url: url.to_string(),
                snippet: item[snippet].as_str().unwrap_or_default().to_string(),
                source: source.to_string(),
            })
        })
        .collect()
}

/// Supadata-style social search adapter: one query fanned across the
/// platforms the service indexes.
pub struct SupadataSocial {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[async_trait]
impl SocialProvider for SupadataSocial {
    async fn search(&self, request: &SocialRequest) -> Result<Vec<SocialPost>, ProviderError> {
        let limit = request.max_results.to_string();
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("q", request.query.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol { message: e.to_string() })?;

        let Some(items) = body["results"].as_array() else {
            return Err(ProviderError::Protocol {
                message: "missing 'results' array".to_string(),
            });
        };
        let posts: Vec<SocialPost> = items
            .iter()
            .filter_map(|item| {
                let text = item["text"].as_str()?;
                Some(SocialPost {
                    platform: item["platform"].as_str().unwrap_or("unknown").to_string(),
                    author: item["author"].as_str().unwrap_or_default().to_string(),
                    text: text.to_string(),
                    url: item["url"].as_str().map(String::from),
                    engagement: item["engagement"].as_u64(),
                })
            })
            .collect();
        if posts.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(posts)
    }
}

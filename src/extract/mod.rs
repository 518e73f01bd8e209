//! Ordered content-extraction chain for URLs.
//!
//! Strategies are tried in a fixed order: a hosted reader service, then
//! plain HTTP with DOM text extraction, then a raw-body fallback. The first
//! strategy producing at least `min_chars` usable characters wins. A
//! strategy failure (error or timeout) never aborts the chain; it is logged
//! and the next strategy runs.

use crate::errors::ProviderError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimum usable characters for a strategy to win the chain.
const DEFAULT_MIN_CHARS: usize = 100;

static SCRIPT_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
        .expect("valid regex")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f]+").expect("valid regex"));
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// One way of turning a URL into text.
#[async_trait]
pub trait ExtractStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, url: &str) -> Result<String, ProviderError>;
}

/// Per-strategy success/failure counters, exposed for status reporting.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StrategyStats {
    pub successes: u64,
    pub failures: u64,
}

/// Runs the strategy list in order until one produces enough text.
pub struct ExtractionChain {
    strategies: Vec<Arc<dyn ExtractStrategy>>,
    min_chars: usize,
    strategy_timeout: Duration,
    stats: Mutex<HashMap<String, StrategyStats>>,
}

impl ExtractionChain {
    pub fn new(strategies: Vec<Arc<dyn ExtractStrategy>>, strategy_timeout: Duration) -> Self {
        Self {
            strategies,
            min_chars: DEFAULT_MIN_CHARS,
            strategy_timeout,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// The production chain: reader service first, DOM text second, raw
    /// body last.
    pub fn standard(client: reqwest::Client, reader_api_key: Option<String>, strategy_timeout: Duration) -> Self {
        Self::new(
            vec![
                Arc::new(ReaderApiStrategy {
                    client: client.clone(),
                    api_key: reader_api_key,
                }),
                Arc::new(DomTextStrategy { client: client.clone() }),
                Arc::new(RawBodyStrategy { client }),
            ],
            strategy_timeout,
        )
    }

    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = min_chars;
        self
    }

    /// Extract text from a URL, or `None` when every strategy comes up short.
    pub async fn extract(&self, url: &str) -> Option<String> {
        for strategy in &self.strategies {
            if let Some(text) = self.try_strategy(strategy, url).await {
                return Some(text);
            }
        }
        tracing::warn!(url, "every extraction strategy failed");
        None
    }

    /// Like [`extract`](Self::extract) but tries a named strategy first.
    pub async fn extract_preferring(&self, url: &str, preferred: &str) -> Option<String> {
        if let Some(strategy) = self.strategies.iter().find(|s| s.name() == preferred) {
            if let Some(text) = self.try_strategy(strategy, url).await {
                return Some(text);
            }
        }
        self.extract(url).await
    }

    pub fn stats(&self) -> HashMap<String, StrategyStats> {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    async fn try_strategy(&self, strategy: &Arc<dyn ExtractStrategy>, url: &str) -> Option<String> {
        let outcome = tokio::time::timeout(self.strategy_timeout, strategy.extract(url)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                seconds: self.strategy_timeout.as_secs(),
            }),
        };

        match result {
            Ok(text) => {
                let text = text.trim().to_string();
                if text.chars().count() >= self.min_chars {
                    tracing::debug!(url, strategy = strategy.name(), chars = text.len(), "extraction succeeded");
                    self.record(strategy.name(), true);
                    return Some(text);
                }
                tracing::debug!(url, strategy = strategy.name(), "extraction too short");
                self.record(strategy.name(), false);
                None
            }
            Err(err) => {
                tracing::debug!(url, strategy = strategy.name(), error = %err, "extraction strategy failed");
                self.record(strategy.name(), false);
                None
            }
        }
    }

    fn record(&self, name: &str, success: bool) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        let entry = stats.entry(name.to_string()).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}

/// Strip markup down to readable text.
pub fn html_to_text(html: &str) -> String {
    let without_blocks = SCRIPT_STYLE_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, "\n");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let collapsed = WHITESPACE_RE.replace_all(&decoded, " ");
    let trimmed_lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    let joined = trimmed_lines.join("\n");
    BLANK_LINES_RE.replace_all(&joined, "\n\n").trim().to_string()
}

/// Hosted reader service (`r.jina.ai` style): prepend the target URL and
/// get markdown-ish text back.
pub struct ReaderApiStrategy {
    client: reqwest::Client,
    api_key: Option<String>,
}

#[async_trait]
impl ExtractStrategy for ReaderApiStrategy {
    fn name(&self) -> &str {
        "reader_api"
    }

    async fn extract(&self, url: &str) -> Result<String, ProviderError> {
        let mut request = self
            .client
            .get(format!("https://r.jina.ai/{url}"))
            .header("Accept", "text/plain");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| ProviderError::Server {
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), "reader service"));
        }
        response.text().await.map_err(|e| ProviderError::Protocol {
            message: e.to_string(),
        })
    }
}

/// Plain HTTP fetch followed by DOM text extraction.
pub struct DomTextStrategy {
    client: reqwest::Client,
}

#[async_trait]
impl ExtractStrategy for DomTextStrategy {
    fn name(&self) -> &str {
        "dom_text"
    }

    async fn extract(&self, url: &str) -> Result<String, ProviderError> {
        let response = fetch_page(&self.client, url).await?;
        Ok(html_to_text(&response))
    }
}

/// Last resort: the raw body with markup crudely removed.
pub struct RawBodyStrategy {
    client: reqwest::Client,
}

#[async_trait]
impl ExtractStrategy for RawBodyStrategy {
    fn name(&self) -> &str {
        "raw_body"
    }

    async fn extract(&self, url: &str) -> Result<String, ProviderError> {
        let body = fetch_page(&self.client, url).await?;
        Ok(TAG_RE.replace_all(&body, " ").trim().to_string())
    }
}

async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<String, ProviderError> {
    let response = client
        .get(url)
        .header("User-Agent", "Mozilla/5.0 (compatible; marketscope/0.1)")
        .send()
        .await
        .map_err(|e| ProviderError::Server {
            message: e.to_string(),
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), "page fetch"));
    }
    response.text().await.map_err(|e| ProviderError::Protocol {
        message: e.to_string(),
    })
}

//! Job request payload and context helpers.

use serde::{Deserialize, Serialize};

/// The analysis job a client submits: a market segment plus optional
/// product, audience and framing details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub segment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectives: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Explicit search query; derived from segment and product when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl JobRequest {
    pub fn new(segment: &str) -> Self {
        Self {
            segment: segment.to_string(),
            product: None,
            audience: None,
            objectives: None,
            context: None,
            query: None,
        }
    }

    pub fn with_product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.segment.trim().is_empty() {
            return Err("segment must not be empty".to_string());
        }
        Ok(())
    }

    /// The query driving the web-search component.
    pub fn search_query(&self) -> String {
        if let Some(query) = &self.query
            && !query.trim().is_empty()
        {
            return query.trim().to_string();
        }
        match &self.product {
            Some(product) => format!("{} {} market analysis", self.segment, product),
            None => format!("{} market analysis", self.segment),
        }
    }

    /// One-paragraph framing reused by every LLM prompt.
    pub fn briefing(&self) -> String {
        let mut parts = vec![format!("Market segment: {}", self.segment)];
        if let Some(product) = &self.product {
            parts.push(format!("Product: {product}"));
        }
        if let Some(audience) = &self.audience {
            parts.push(format!("Target audience: {audience}"));
        }
        if let Some(objectives) = &self.objectives {
            parts.push(format!("Objectives: {objectives}"));
        }
        if let Some(context) = &self.context {
            parts.push(format!("Additional context: {context}"));
        }
        parts.join("\n")
    }
}

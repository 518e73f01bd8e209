//! The analytical components of the default pipeline and their executors.
//!
//! Three executor families cover the twelve stages: a search-and-extract
//! executor for `web_search`, a social-search executor honouring the
//! synthetic-fallback policy, and a generic LLM executor parameterised by
//! the stage's focus and output key. Stage prompts are deliberately thin;
//! the engineering lives in dispatch, validation and checkpointing.

use crate::errors::DispatchError;
use crate::extract::ExtractionChain;
use crate::pipeline::component::{
    ComponentDefinition, ComponentExecutor, ComponentInput, ComponentRegistry, requires_fields,
};
use crate::provider::{Dispatcher, LlmRequest, SearchRequest, SocialRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How many search hits are fed into page extraction.
const PAGES_TO_EXTRACT: usize = 3;
/// Longest predecessor digest included in a prompt.
const DIGEST_CHARS: usize = 1_500;
/// Longest page excerpt stored in the web-search artifact.
const EXCERPT_CHARS: usize = 500;

/// Searches the web for the job's query and extracts the top pages.
pub struct WebSearchExecutor {
    dispatcher: Arc<Dispatcher>,
    extractor: Arc<ExtractionChain>,
    max_results: usize,
}

impl WebSearchExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>, extractor: Arc<ExtractionChain>) -> Self {
        Self {
            dispatcher,
            extractor,
            max_results: 10,
        }
    }
}

#[async_trait]
impl ComponentExecutor for WebSearchExecutor {
    async fn execute(&self, input: &ComponentInput, cancel: &CancellationToken) -> Result<Value> {
        let query = input.job.search_query();
        let request = SearchRequest::new(&query).with_max_results(self.max_results);
        let hits = self.dispatcher.search(&request, cancel).await?;

        let mut extracted_pages = Vec::new();
        for hit in hits.iter().take(PAGES_TO_EXTRACT) {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(text) = self.extractor.extract(&hit.url).await {
                extracted_pages.push(json!({
                    "url": hit.url,
                    "chars": text.chars().count(),
                    "excerpt": truncate(&text, EXCERPT_CHARS),
                }));
            }
        }

        Ok(json!({
            "query": query,
            "total_results": hits.len(),
            "results": hits,
            "extracted_pages": extracted_pages,
        }))
    }
}

/// Searches social platforms for audience signal. When no social provider
/// is live the behaviour is policy-controlled: error out (default) or emit
/// a clearly-marked synthetic placeholder.
pub struct SocialAnalysisExecutor {
    dispatcher: Arc<Dispatcher>,
    allow_synthetic_fallback: bool,
}

impl SocialAnalysisExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>, allow_synthetic_fallback: bool) -> Self {
        Self {
            dispatcher,
            allow_synthetic_fallback,
        }
    }
}

#[async_trait]
impl ComponentExecutor for SocialAnalysisExecutor {
    async fn execute(&self, input: &ComponentInput, cancel: &CancellationToken) -> Result<Value> {
        let request = SocialRequest::new(input.job.search_query());
        match self.dispatcher.social_search(&request, cancel).await {
            Ok(posts) => {
                let mut by_platform: std::collections::BTreeMap<String, usize> =
                    std::collections::BTreeMap::new();
                for post in &posts {
                    *by_platform.entry(post.platform.clone()).or_default() += 1;
                }
                Ok(json!({
                    "query": request.query,
                    "total_posts": posts.len(),
                    "platforms": by_platform,
                    "posts": posts,
                }))
            }
            Err(DispatchError::AllProvidersExhausted { .. }) if self.allow_synthetic_fallback => {
                tracing::warn!("no social provider live; emitting marked synthetic placeholder");
                Ok(json!({
                    "query": request.query,
                    "total_posts": 0,
                    "platforms": {},
                    "posts": [],
                    "synthetic": true,
                    "fallback_used": true,
                    "note": "no social provider configured; placeholder emitted by policy",
                }))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Generic LLM-backed stage: builds a prompt from the job briefing, its
/// focus instruction and the digests of its predecessors, then shapes the
/// response under the stage's output key.
pub struct LlmAnalysisExecutor {
    dispatcher: Arc<Dispatcher>,
    focus: &'static str,
    output_key: &'static str,
}

impl LlmAnalysisExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>, focus: &'static str, output_key: &'static str) -> Self {
        Self {
            dispatcher,
            focus,
            output_key,
        }
    }

    fn build_prompt(&self, input: &ComponentInput) -> String {
        let mut prompt = format!("{}\n\n{}\n", input.job.briefing(), self.focus);
        if !input.previous_results.is_empty() {
            prompt.push_str("\nFindings from earlier stages:\n");
            for (name, value) in &input.previous_results {
                prompt.push_str(&format!("- {name}: {}\n", digest(value)));
            }
        }
        prompt.push_str(&format!(
            "\nRespond with a JSON object whose top-level key is \"{}\".",
            self.output_key
        ));
        prompt
    }
}

#[async_trait]
impl ComponentExecutor for LlmAnalysisExecutor {
    async fn execute(&self, input: &ComponentInput, cancel: &CancellationToken) -> Result<Value> {
        let request = LlmRequest::new(self.build_prompt(input))
            .with_system("You are a senior market-analysis specialist. Be concrete and concise.");
        let response = self.dispatcher.generate(&request, cancel).await?;

        let mut shaped = shape_response(&response.text, self.output_key);
        if let Some(map) = shaped.as_object_mut() {
            map.insert("provider".to_string(), json!(response.provider));
            if let Some(model) = &response.model {
                map.insert("model".to_string(), json!(model));
            }
        }
        Ok(shaped)
    }
}

/// Coerce an LLM reply into `{output_key: ...}`: fenced or bare JSON
/// objects pass through (wrapped when the key is missing), anything else
/// becomes the key's text value.
fn shape_response(text: &str, output_key: &str) -> Value {
    let stripped = strip_code_fence(text);
    if let Ok(parsed) = serde_json::from_str::<Value>(stripped)
        && parsed.is_object()
    {
        if parsed.get(output_key).is_some() {
            return parsed;
        }
        return json!({ output_key: parsed });
    }
    json!({ output_key: text.trim() })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim().strip_suffix("```").unwrap_or(inner).trim()
}

fn digest(value: &Value) -> String {
    truncate(&value.to_string(), DIGEST_CHARS)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Wiring for the twelve-stage default pipeline. Dependency edges and the
/// required flags mirror the production analysis flow.
pub fn register_default_pipeline(
    registry: &ComponentRegistry,
    dispatcher: Arc<Dispatcher>,
    extractor: Arc<ExtractionChain>,
    allow_synthetic_fallback: bool,
) -> Result<()> {
    let llm = |focus: &'static str, key: &'static str| {
        Arc::new(LlmAnalysisExecutor::new(dispatcher.clone(), focus, key))
    };

    registry.register(
        ComponentDefinition::new(
            "web_search",
            Arc::new(WebSearchExecutor::new(dispatcher.clone(), extractor)),
        )
        .with_category(crate::checkpoint::categories::WEB_SEARCH)
        .with_validator(requires_fields(&["results"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "social_analysis",
            Arc::new(SocialAnalysisExecutor::new(
                dispatcher.clone(),
                allow_synthetic_fallback,
            )),
        )
        .with_dependencies(&["web_search"]),
    )?;

    registry.register(
        ComponentDefinition::new(
            "mental_drivers",
            llm(
                "Identify the psychological drivers that move buyers in this segment: name each driver, its central trigger and how it surfaces in buying decisions.",
                "drivers",
            ),
        )
        .with_dependencies(&["web_search", "social_analysis"])
        .with_validator(requires_fields(&["drivers"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "detailed_avatar",
            llm(
                "Build a detailed customer avatar: demographics, visceral pains, hidden desires and the language they use about the problem.",
                "avatar",
            ),
        )
        .with_dependencies(&["web_search", "social_analysis"])
        .with_validator(requires_fields(&["avatar"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "future_predictions",
            llm(
                "Project where this market is heading over the next three years: trends, inflection points and the risks to the product's thesis.",
                "predictions",
            ),
        )
        .with_dependencies(&["web_search", "social_analysis"])
        .with_validator(requires_fields(&["predictions"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "visual_proofs",
            llm(
                "Propose visual proof concepts (demonstrations, comparisons, before/after framings) that make the offer's value tangible.",
                "proofs",
            ),
        )
        .with_dependencies(&["mental_drivers"])
        .with_validator(requires_fields(&["proofs"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "anti_objection",
            llm(
                "List the strongest objections a prospect will raise and a rebuttal strategy for each, ordered by how often they kill deals.",
                "objections",
            ),
        )
        .with_dependencies(&["mental_drivers"])
        .with_validator(requires_fields(&["objections"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "pre_pitch",
            llm(
                "Design the pre-pitch sequence: the beliefs to install before the offer is shown, and the order to install them in.",
                "pre_pitch",
            ),
        )
        .with_dependencies(&["mental_drivers", "anti_objection"])
        .with_validator(requires_fields(&["pre_pitch"])),
    )?;

    registry.register(
        ComponentDefinition::new(
            "sales_funnel",
            llm(
                "Sketch the sales funnel for this offer: stages, conversion levers per stage and the metrics worth instrumenting.",
                "funnel",
            ),
        )
        .with_dependencies(&["mental_drivers", "anti_objection"])
        .with_validator(requires_fields(&["funnel"]))
        .required(false),
    )?;

    registry.register(
        ComponentDefinition::new(
            "competitor_analysis",
            llm(
                "Map the competitive landscape: direct and indirect competitors, their positioning and the gaps this product can own.",
                "competitors",
            ),
        )
        .with_dependencies(&["web_search"])
        .with_validator(requires_fields(&["competitors"]))
        .required(false),
    )?;

    registry.register(
        ComponentDefinition::new(
            "action_plan",
            llm(
                "Turn the analysis into a 90-day action plan: concrete moves, owners and the order they should happen in.",
                "plan",
            ),
        )
        .with_dependencies(&["mental_drivers", "future_predictions"])
        .with_validator(requires_fields(&["plan"]))
        .required(false),
    )?;

    registry.register(
        ComponentDefinition::new(
            "positioning",
            llm(
                "Write the positioning statement: the category, the differentiated claim and the proof that supports it.",
                "positioning",
            ),
        )
        .with_dependencies(&["competitor_analysis", "detailed_avatar"])
        .with_validator(requires_fields(&["positioning"]))
        .required(false),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_response_passes_through_matching_objects() {
        let shaped = shape_response(r#"{"drivers": [{"name": "urgency"}]}"#, "drivers");
        assert!(shaped["drivers"].is_array());
    }

    #[test]
    fn shape_response_wraps_mismatched_objects() {
        let shaped = shape_response(r#"{"something": 1}"#, "drivers");
        assert_eq!(shaped["drivers"]["something"], 1);
    }

    #[test]
    fn shape_response_wraps_plain_text() {
        let shaped = shape_response("Buyers want speed.", "drivers");
        assert_eq!(shaped["drivers"], "Buyers want speed.");
    }

    #[test]
    fn shape_response_strips_code_fences() {
        let fenced = "```json\n{\"drivers\": []}\n```";
        let shaped = shape_response(fenced, "drivers");
        assert!(shaped["drivers"].is_array());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate(&text, 4);
        assert!(cut.starts_with("éééé"));
        assert!(cut.ends_with('…'));
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn default_pipeline_registers_twelve_components() {
        use crate::provider::rate_limit::RateLimiter;
        use crate::provider::registry::ProviderRegistry;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProviderRegistry::new()),
            Arc::new(RateLimiter::new()),
            crate::provider::dispatch::DispatchConfig::default(),
        ));
        let extractor = Arc::new(ExtractionChain::new(vec![], std::time::Duration::from_secs(1)));
        let registry = ComponentRegistry::new();
        register_default_pipeline(&registry, dispatcher, extractor, false).unwrap();

        assert_eq!(registry.len(), 12);
        let order = registry.execution_order();
        assert_eq!(order.first().map(String::as_str), Some("web_search"));
        // Every dependency precedes its dependents.
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("mental_drivers") > position("social_analysis"));
        assert!(position("pre_pitch") > position("anti_objection"));
        assert!(position("positioning") > position("competitor_analysis"));
        assert!(position("positioning") > position("detailed_avatar"));
    }
}

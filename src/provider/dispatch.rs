//! Fallback dispatcher: picks the best live provider in a class, rotates on
//! failure, and absorbs every per-provider error.
//!
//! The candidate order is fetched from the registry once per invocation and
//! not re-fetched mid-rotation, so flapping health state cannot starve a
//! call. Component executors only ever see `AllProvidersExhausted` or
//! `Cancelled`.

use crate::errors::{DispatchError, ErrorKind, ProviderError};
use crate::provider::rate_limit::{Permit, RateLimiter};
use crate::provider::registry::ProviderRegistry;
use crate::provider::{
    LlmProvider, LlmRequest, LlmResponse, ProviderClass, SearchHit, SearchProvider,
    SearchRequest, SocialPost, SocialProvider, SocialRequest,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deadlines and pacing tolerances for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Hard per-call deadline for LLM providers
    pub llm_deadline: Duration,
    /// Hard per-call deadline for search and social providers
    pub search_deadline: Duration,
    /// Longest rate-limiter wait the dispatcher will sleep through
    pub max_wait: Duration,
    /// Worker cap for fanned-out LLM prompts
    pub max_parallel_prompts: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            llm_deadline: Duration::from_secs(60),
            search_deadline: Duration::from_secs(30),
            max_wait: Duration::from_secs(2),
            max_parallel_prompts: 4,
        }
    }
}

/// Routes class-specific requests to the healthiest provider, rotating
/// through the ranked candidates until one succeeds.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<RateLimiter>,
    config: DispatchConfig,
    llm: HashMap<String, Arc<dyn LlmProvider>>,
    search: HashMap<String, Arc<dyn SearchProvider>>,
    social: HashMap<String, Arc<dyn SocialProvider>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<RateLimiter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            config,
            llm: HashMap::new(),
            search: HashMap::new(),
            social: HashMap::new(),
        }
    }

    pub fn with_llm(mut self, name: &str, provider: Arc<dyn LlmProvider>) -> Self {
        self.llm.insert(name.to_string(), provider);
        self
    }

    pub fn with_search(mut self, name: &str, provider: Arc<dyn SearchProvider>) -> Self {
        self.search.insert(name.to_string(), provider);
        self
    }

    pub fn with_social(mut self, name: &str, provider: Arc<dyn SocialProvider>) -> Self {
        self.social.insert(name.to_string(), provider);
        self
    }

    pub fn has_social_providers(&self) -> bool {
        !self.social.is_empty()
    }

    /// Generate text with the best live LLM provider.
    pub async fn generate(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, DispatchError> {
        let deadline = self.config.llm_deadline;
        self.invoke(ProviderClass::Llm, cancel, |name| {
            let provider = self.llm.get(name).cloned();
            let model = self.registry.get(name).and_then(|e| e.model);
            let name = name.to_string();
            async move {
                let provider = provider.ok_or_else(|| ProviderError::Protocol {
                    message: format!("no adapter wired for provider '{name}'"),
                })?;
                let text = provider.generate(request).await?;
                Ok(LlmResponse {
                    text,
                    provider: name,
                    model,
                })
            }
        }, deadline)
        .await
    }

    /// Search the web with the best live search provider.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, DispatchError> {
        let deadline = self.config.search_deadline;
        self.invoke(ProviderClass::Search, cancel, |name| {
            let provider = self.search.get(name).cloned();
            let name = name.to_string();
            async move {
                let provider = provider.ok_or_else(|| ProviderError::Protocol {
                    message: format!("no adapter wired for provider '{name}'"),
                })?;
                provider.search(request).await
            }
        }, deadline)
        .await
    }

    /// Search social media with the best live social provider.
    pub async fn social_search(
        &self,
        request: &SocialRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SocialPost>, DispatchError> {
        let deadline = self.config.search_deadline;
        self.invoke(ProviderClass::Social, cancel, |name| {
            let provider = self.social.get(name).cloned();
            let name = name.to_string();
            async move {
                let provider = provider.ok_or_else(|| ProviderError::Protocol {
                    message: format!("no adapter wired for provider '{name}'"),
                })?;
                provider.search(request).await
            }
        }, deadline)
        .await
    }

    /// Fan several independent prompts out on a bounded worker pool.
    /// Each prompt goes through the full fallback rotation on its own.
    pub async fn generate_many(
        &self,
        prompts: Vec<(String, LlmRequest)>,
        cancel: &CancellationToken,
    ) -> HashMap<String, Result<LlmResponse, DispatchError>> {
        let results: Vec<(String, Result<LlmResponse, DispatchError>)> =
            futures::stream::iter(prompts.into_iter().map(|(key, request)| async move {
                let result = self.generate(&request, cancel).await;
                (key, result)
            }))
            .buffer_unordered(self.config.max_parallel_prompts.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Shared rotation loop. `call` builds the class-specific future for one
    /// named candidate; the loop owns pacing, deadlines, classification and
    /// registry bookkeeping.
    async fn invoke<T, F, Fut>(
        &self,
        class: ProviderClass,
        cancel: &CancellationToken,
        call: F,
        deadline: Duration,
    ) -> Result<T, DispatchError>
    where
        F: Fn(&str) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        // Snapshot the ranked order once; it is not re-fetched mid-rotation.
        let candidates = self.registry.list_available(class);
        let mut tried = Vec::with_capacity(candidates.len());

        for entry in &candidates {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let name = entry.name.as_str();

            match self.acquire_with_wait(name, cancel).await? {
                Permit::Ready => {}
                Permit::QuotaExhausted => {
                    // Quota spent for the day: the registry cooldown takes
                    // this key out of rotation for subsequent invocations.
                    self.registry.record_failure(name, ErrorKind::RateLimited);
                    tried.push(name.to_string());
                    continue;
                }
                Permit::RetryAfter(_) => {
                    // Still pacing after the bounded wait; skip without
                    // penalising the provider's health.
                    tried.push(name.to_string());
                    continue;
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                result = tokio::time::timeout(deadline, call(name)) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout { seconds: deadline.as_secs() }),
                },
            };

            match outcome {
                Ok(value) => {
                    self.registry.record_success(name);
                    tracing::debug!(provider = name, %class, "dispatch succeeded");
                    return Ok(value);
                }
                Err(ProviderError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(err) => {
                    let kind = err.kind();
                    tracing::warn!(provider = name, %class, %kind, error = %err, "provider attempt failed");
                    self.registry.record_failure(name, kind);
                    tried.push(name.to_string());
                }
            }
        }

        Err(DispatchError::AllProvidersExhausted {
            class: class.to_string(),
            tried,
        })
    }

    /// One rate-limiter round: grant, or sleep through a short advised wait
    /// and ask again. Waits longer than `max_wait` are handed back as a
    /// refusal so the rotation can move on.
    async fn acquire_with_wait(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Permit, DispatchError> {
        match self.limiter.acquire(name) {
            Permit::RetryAfter(wait) if wait <= self.config.max_wait => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                Ok(self.limiter.acquire(name))
            }
            permit => Ok(permit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderState;
    use crate::provider::registry::ProviderEntry;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted LLM provider: pops one outcome per call.
    struct ScriptedLlm {
        script: Mutex<Vec<Result<String, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, _request: &LlmRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok("default".to_string())
            } else {
                script.remove(0)
            }
        }
    }

    fn setup(entries: &[&str]) -> (Arc<ProviderRegistry>, Arc<RateLimiter>) {
        let registry = Arc::new(ProviderRegistry::new());
        for (i, name) in entries.iter().enumerate() {
            registry.register(ProviderEntry::new(name, ProviderClass::Llm, i as u32 + 1));
        }
        (registry, Arc::new(RateLimiter::new()))
    }

    fn dispatcher(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> Dispatcher {
        Dispatcher::new(registry, limiter, DispatchConfig::default())
    }

    #[tokio::test]
    async fn first_healthy_provider_serves_the_call() {
        let (registry, limiter) = setup(&["llm.p1", "llm.p2"]);
        let p1 = ScriptedLlm::new(vec![Ok("from p1".into())]);
        let p2 = ScriptedLlm::new(vec![]);
        let dispatcher = dispatcher(registry.clone(), limiter)
            .with_llm("llm.p1", p1.clone())
            .with_llm("llm.p2", p2.clone());

        let response = dispatcher
            .generate(&LlmRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "from p1");
        assert_eq!(response.provider, "llm.p1");
        assert_eq!(p2.call_count(), 0);
        assert_eq!(registry.get("llm.p1").unwrap().total_successes, 1);
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back_to_secondary() {
        let (registry, limiter) = setup(&["llm.p1", "llm.p2"]);
        let p1 = ScriptedLlm::new(vec![Err(ProviderError::RateLimited {
            message: "429".into(),
        })]);
        let p2 = ScriptedLlm::new(vec![Ok("from p2".into())]);
        let dispatcher = dispatcher(registry.clone(), limiter)
            .with_llm("llm.p1", p1)
            .with_llm("llm.p2", p2);

        let response = dispatcher
            .generate(&LlmRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.provider, "llm.p2");

        let p1_entry = registry.get("llm.p1").unwrap();
        assert_eq!(p1_entry.consecutive_failures, 1);
        assert!(p1_entry.disabled_until.unwrap() > chrono::Utc::now());
    }

    #[tokio::test]
    async fn exhaustion_lists_every_attempted_provider() {
        let (registry, limiter) = setup(&["llm.p1", "llm.p2"]);
        let failing = || {
            ScriptedLlm::new(vec![Err(ProviderError::Server {
                message: "boom".into(),
            })])
        };
        let dispatcher = dispatcher(registry, limiter)
            .with_llm("llm.p1", failing())
            .with_llm("llm.p2", failing());

        let err = dispatcher
            .generate(&LlmRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::AllProvidersExhausted { class, tried } => {
                assert_eq!(class, "llm");
                assert_eq!(tried, vec!["llm.p1", "llm.p2"]);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quota_exhaustion_rotates_and_penalises() {
        let (registry, limiter) = setup(&["llm.p1", "llm.p2"]);
        limiter.configure("llm.p1", Duration::ZERO, Some(0));
        let p1 = ScriptedLlm::new(vec![]);
        let p2 = ScriptedLlm::new(vec![Ok("from p2".into())]);
        let dispatcher = dispatcher(registry.clone(), limiter)
            .with_llm("llm.p1", p1.clone())
            .with_llm("llm.p2", p2);

        let response = dispatcher
            .generate(&LlmRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.provider, "llm.p2");
        // The adapter was never called; the quota refusal was the failure.
        assert_eq!(p1.call_count(), 0);
        assert_eq!(registry.get("llm.p1").unwrap().state, ProviderState::Disabled);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let (registry, limiter) = setup(&["llm.p1"]);
        let dispatcher = dispatcher(registry, limiter).with_llm("llm.p1", ScriptedLlm::new(vec![]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher
            .generate(&LlmRequest::new("hi"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn short_pacing_waits_are_slept_through() {
        let (registry, limiter) = setup(&["llm.p1"]);
        limiter.configure("llm.p1", Duration::from_millis(30), None);
        let p1 = ScriptedLlm::new(vec![Ok("a".into()), Ok("b".into())]);
        let dispatcher = dispatcher(registry, limiter).with_llm("llm.p1", p1.clone());

        let cancel = CancellationToken::new();
        dispatcher.generate(&LlmRequest::new("1"), &cancel).await.unwrap();
        // Second call lands inside the 30 ms gap; the dispatcher sleeps
        // rather than reporting exhaustion.
        let response = dispatcher.generate(&LlmRequest::new("2"), &cancel).await.unwrap();
        assert_eq!(response.text, "b");
        assert_eq!(p1.call_count(), 2);
    }

    #[tokio::test]
    async fn generate_many_returns_one_result_per_prompt() {
        let (registry, limiter) = setup(&["llm.p1"]);
        let dispatcher =
            dispatcher(registry, limiter).with_llm("llm.p1", ScriptedLlm::new(vec![]));

        let prompts = vec![
            ("a".to_string(), LlmRequest::new("one")),
            ("b".to_string(), LlmRequest::new("two")),
            ("c".to_string(), LlmRequest::new("three")),
        ];
        let results = dispatcher.generate_many(prompts, &CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
    }
}

//! The orchestrator facade: one wiring struct holding every subsystem,
//! and the three operations request handlers call.
//!
//! There are no globals anywhere in the engine; the registry, limiter,
//! store, component registry and session manager are built here and passed
//! down explicitly, which is also what makes the scenario tests possible.

use crate::analysis::{JobRequest, register_default_pipeline};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::errors::SessionError;
use crate::extract::ExtractionChain;
use crate::pipeline::component::ComponentRegistry;
use crate::pipeline::normalize::FinalReport;
use crate::pipeline::runner::PipelineRunner;
use crate::provider::adapters;
use crate::provider::dispatch::{DispatchConfig, Dispatcher};
use crate::provider::rate_limit::RateLimiter;
use crate::provider::registry::{ProviderEntry, ProviderRegistry};
use crate::provider::ProviderClass;
use crate::session::manager::{ReportState, SessionManager, SessionSnapshot, SessionStatus};
use crate::session::progress::ProgressEvent;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// The engine facade. Cheap to clone via `Arc`; the HTTP surface holds one.
pub struct Engine {
    config: Config,
    providers: Arc<ProviderRegistry>,
    store: Arc<CheckpointStore>,
    sessions: Arc<SessionManager>,
    components: Arc<ComponentRegistry>,
}

impl Engine {
    /// Wire the production engine from configuration: real adapters, the
    /// default pipeline, and a checkpoint store under `config.data_dir`.
    pub fn new(config: Config) -> Result<Self> {
        let providers = Arc::new(ProviderRegistry::new());
        let limiter = Arc::new(RateLimiter::new());

        let llm_client = http_client(config.limits.llm_deadline())?;
        let search_client = http_client(config.limits.search_deadline())?;

        let mut dispatcher = Dispatcher::new(
            providers.clone(),
            limiter.clone(),
            DispatchConfig {
                llm_deadline: config.limits.llm_deadline(),
                search_deadline: config.limits.search_deadline(),
                max_wait: config.limits.dispatch_max_wait(),
                ..DispatchConfig::default()
            },
        );

        for entry in &config.llm_providers {
            register_entry(&providers, &limiter, entry, ProviderClass::Llm, config.limits.llm_min_interval_secs);
            dispatcher = dispatcher.with_llm(&entry.name, adapters::llm_adapter(entry, &llm_client));
        }
        for entry in &config.search_providers {
            register_entry(&providers, &limiter, entry, ProviderClass::Search, config.limits.search_min_interval_secs);
            dispatcher =
                dispatcher.with_search(&entry.name, adapters::search_adapter(entry, &search_client));
        }
        for entry in &config.social_providers {
            register_entry(&providers, &limiter, entry, ProviderClass::Social, config.limits.search_min_interval_secs);
            dispatcher =
                dispatcher.with_social(&entry.name, adapters::social_adapter(entry, &search_client));
        }

        let dispatcher = Arc::new(dispatcher);
        let extractor = Arc::new(ExtractionChain::standard(
            search_client,
            config.reader_api_key.clone(),
            config.limits.extract_strategy_deadline(),
        ));

        let components = Arc::new(ComponentRegistry::new());
        register_default_pipeline(
            &components,
            dispatcher.clone(),
            extractor,
            config.allow_synthetic_fallback,
        )
        .context("failed to register the default pipeline")?;

        Ok(Self::assemble(config, providers, components))
    }

    /// Test seam: wire an engine around pre-built parts. The caller
    /// registers its own components and dispatcher adapters.
    pub fn with_parts(
        config: Config,
        providers: Arc<ProviderRegistry>,
        store: Arc<CheckpointStore>,
        components: Arc<ComponentRegistry>,
    ) -> Self {
        let runner = Arc::new(PipelineRunner::new(
            components.clone(),
            store.clone(),
            config.limits.component_deadline(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            providers.clone(),
            components.clone(),
            runner,
            config.max_concurrent_sessions,
            config.capacity_policy,
        ));
        Self {
            config,
            providers,
            store,
            sessions,
            components,
        }
    }

    fn assemble(
        config: Config,
        providers: Arc<ProviderRegistry>,
        components: Arc<ComponentRegistry>,
    ) -> Self {
        let store = Arc::new(CheckpointStore::new(config.data_dir.clone()));
        Self::with_parts(config, providers, store, components)
    }

    /// Submit a job; execution starts asynchronously.
    pub fn submit(&self, job: JobRequest) -> Result<String, SessionError> {
        self.require_providers()?;
        self.sessions.start(job)
    }

    /// Convenience for tests and CLIs: submit and block until terminal.
    pub async fn run_synchronously(&self, job: JobRequest) -> Result<FinalReport, SessionError> {
        let id = self.submit(job)?;
        self.sessions.wait_for_terminal(&id).await?;
        match self.get_report(&id) {
            ReportState::Ready(report) => Ok(*report),
            // Cancelled or storage-failed sessions end without a report.
            _ => Err(SessionError::NotFound(id)),
        }
    }

    /// The consolidated report: from memory if live, otherwise from the
    /// checkpointed copy.
    pub fn get_report(&self, id: &str) -> ReportState {
        match self.sessions.report(id) {
            ReportState::NotFound => match self.store.load_artifact(id, "consolidated_report") {
                Ok(artifact) => match serde_json::from_value::<FinalReport>(artifact.payload) {
                    Ok(report) => ReportState::Ready(Box::new(report)),
                    Err(_) => ReportState::NotFound,
                },
                Err(_) => ReportState::NotFound,
            },
            state => state,
        }
    }

    pub fn status(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id)
    }

    pub fn progress(&self, id: &str) -> Option<ProgressEvent> {
        self.sessions.latest_progress(id)
    }

    pub fn subscribe_progress(
        &self,
        id: &str,
    ) -> Option<tokio::sync::broadcast::Receiver<ProgressEvent>> {
        self.sessions.subscribe(id)
    }

    pub fn pause(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.pause(id)
    }

    pub fn resume(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.resume(id)
    }

    pub fn continue_from_persisted(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.continue_from_persisted(id)
    }

    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.cancel(id)
    }

    pub fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.delete(id)
    }

    pub fn clear_sessions(&self) -> usize {
        self.sessions.clear_all()
    }

    pub fn list_sessions(&self) -> Vec<crate::checkpoint::SessionSummary> {
        self.sessions.list()
    }

    pub async fn wait_for_terminal(&self, id: &str) -> Result<SessionStatus, SessionError> {
        self.sessions.wait_for_terminal(id).await
    }

    pub fn provider_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.providers.snapshot()).unwrap_or_default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    /// A class with no registered credentials is disabled; jobs need at
    /// least one LLM and one search provider.
    fn require_providers(&self) -> Result<(), SessionError> {
        let snapshot = self.providers.snapshot();
        let has = |class: ProviderClass| snapshot.values().any(|e| e.class == class);
        if has(ProviderClass::Llm) && has(ProviderClass::Search) {
            Ok(())
        } else {
            Err(SessionError::ProvidersUnconfigured)
        }
    }
}

fn register_entry(
    providers: &ProviderRegistry,
    limiter: &RateLimiter,
    entry: &crate::config::CredentialEntry,
    class: ProviderClass,
    default_interval_secs: f64,
) {
    let mut registered = ProviderEntry::new(&entry.name, class, entry.priority);
    if let Some(model) = &entry.model {
        registered = registered.with_model(model);
    }
    providers.register(registered);

    let interval = entry.min_interval_secs.unwrap_or(default_interval_secs);
    limiter.configure(
        &entry.name,
        Duration::from_secs_f64(interval.max(0.0)),
        entry.daily_quota,
    );
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")
}

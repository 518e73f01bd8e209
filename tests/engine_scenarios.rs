//! End-to-end scenarios for the execution engine: fallback rotation,
//! pause/resume, cancellation, provider exhaustion and continuation from
//! persisted artifacts, all driven through the engine facade with scripted
//! providers.

use anyhow::Result;
use async_trait::async_trait;
use marketscope::analysis::JobRequest;
use marketscope::checkpoint::CheckpointStore;
use marketscope::config::Config;
use marketscope::engine::Engine;
use marketscope::errors::ProviderError;
use marketscope::pipeline::component::{
    ComponentDefinition, ComponentExecutor, ComponentInput, ComponentRegistry, ComponentStatus,
};
use marketscope::provider::dispatch::{DispatchConfig, Dispatcher};
use marketscope::provider::rate_limit::RateLimiter;
use marketscope::provider::registry::{ProviderEntry, ProviderRegistry, ProviderState};
use marketscope::provider::{
    LlmProvider, LlmRequest, ProviderClass, SearchHit, SearchProvider, SearchRequest,
};
use marketscope::session::manager::{ReportState, SessionStatus};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Scripted providers ────────────────────────────────────────────────

/// LLM provider that pops scripted outcomes, then repeats its default.
struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default: Option<String>,
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn healthy(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default: Some(reply.to_string()),
            calls: AtomicU32::new(0),
        })
    }

    fn scripted(script: Vec<Result<String, ProviderError>>, default: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default: default.map(String::from),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, _request: &LlmRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }
        match &self.default {
            Some(reply) => Ok(reply.clone()),
            None => Err(ProviderError::Server {
                message: "script exhausted".into(),
            }),
        }
    }
}

struct HealthySearch;

#[async_trait]
impl SearchProvider for HealthySearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ProviderError> {
        Ok(vec![SearchHit {
            title: "Market overview".into(),
            url: "https://example.com/overview".into(),
            snippet: format!("results for {}", request.query),
            source: "search.s1".into(),
        }])
    }
}

// ── Test components ───────────────────────────────────────────────────

/// Calls the search dispatcher and reports the hits.
struct SearchComponent {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl ComponentExecutor for SearchComponent {
    async fn execute(&self, input: &ComponentInput, cancel: &CancellationToken) -> Result<Value> {
        let request = SearchRequest::new(input.job.search_query());
        let hits = self.dispatcher.search(&request, cancel).await?;
        Ok(json!({"total_results": hits.len(), "results": hits}))
    }
}

/// Calls the LLM dispatcher and records which provider answered.
struct LlmComponent {
    dispatcher: Arc<Dispatcher>,
    key: &'static str,
    calls: Arc<AtomicU32>,
}

impl LlmComponent {
    fn new(dispatcher: &Arc<Dispatcher>, key: &'static str) -> (Arc<AtomicU32>, Arc<Self>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            calls.clone(),
            Arc::new(Self {
                dispatcher: dispatcher.clone(),
                key,
                calls,
            }),
        )
    }
}

#[async_trait]
impl ComponentExecutor for LlmComponent {
    async fn execute(&self, _input: &ComponentInput, cancel: &CancellationToken) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .dispatcher
            .generate(&LlmRequest::new("analyze"), cancel)
            .await?;
        Ok(json!({self.key: response.text, "provider": response.provider}))
    }
}

/// Always raises, for required-failure scenarios.
struct FailingComponent;

#[async_trait]
impl ComponentExecutor for FailingComponent {
    async fn execute(&self, _input: &ComponentInput, _cancel: &CancellationToken) -> Result<Value> {
        anyhow::bail!("synthetic component failure")
    }
}

/// Echoes whatever its predecessors produced.
struct EchoComponent {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl ComponentExecutor for EchoComponent {
    async fn execute(&self, input: &ComponentInput, _cancel: &CancellationToken) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"seen": input.previous_results}))
    }
}

/// Sleeps, then succeeds; counts executions.
struct SlowComponent {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl ComponentExecutor for SlowComponent {
    async fn execute(&self, _input: &ComponentInput, _cancel: &CancellationToken) -> Result<Value> {
        tokio::time::sleep(self.delay).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"done": true}))
    }
}

// ── Harness ───────────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    engine: Engine,
    providers: Arc<ProviderRegistry>,
    components: Arc<ComponentRegistry>,
    store: Arc<CheckpointStore>,
    dispatcher: Arc<Dispatcher>,
}

fn harness(wire: impl FnOnce(Dispatcher) -> Dispatcher) -> Harness {
    let dir = TempDir::new().unwrap();
    let providers = Arc::new(ProviderRegistry::new());
    let limiter = Arc::new(RateLimiter::new());
    let store = Arc::new(CheckpointStore::new(dir.path()));
    let components = Arc::new(ComponentRegistry::new());

    let dispatcher = Arc::new(wire(Dispatcher::new(
        providers.clone(),
        limiter,
        DispatchConfig::default(),
    )));

    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    let engine = Engine::with_parts(config, providers.clone(), store.clone(), components.clone());

    Harness {
        _dir: dir,
        engine,
        providers,
        components,
        store,
        dispatcher,
    }
}

fn register_llm(providers: &ProviderRegistry, name: &str, priority: u32) {
    providers.register(ProviderEntry::new(name, ProviderClass::Llm, priority));
}

fn register_search(providers: &ProviderRegistry, name: &str) {
    providers.register(ProviderEntry::new(name, ProviderClass::Search, 1));
}

fn job() -> JobRequest {
    JobRequest::new("fitness").with_product("coaching app")
}

async fn wait_for_status(engine: &Engine, id: &str, wanted: SessionStatus) {
    for _ in 0..200 {
        if engine.status(id).map(|s| s.status) == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached {wanted}");
}

/// Registers the three-stage pipeline used by the basic scenarios:
/// web_search -> avatar -> drivers.
fn register_linear_pipeline(h: &Harness) -> (Arc<AtomicU32>, Arc<AtomicU32>) {
    h.components
        .register(ComponentDefinition::new(
            "web_search",
            Arc::new(SearchComponent {
                dispatcher: h.dispatcher.clone(),
            }),
        ))
        .unwrap();
    let (avatar_calls, avatar) = LlmComponent::new(&h.dispatcher, "avatar");
    h.components
        .register(ComponentDefinition::new("avatar", avatar).with_dependencies(&["web_search"]))
        .unwrap();
    let (drivers_calls, drivers) = LlmComponent::new(&h.dispatcher, "drivers");
    h.components
        .register(ComponentDefinition::new("drivers", drivers).with_dependencies(&["avatar"]))
        .unwrap();
    (avatar_calls, drivers_calls)
}

// ── Scenario A: happy path ────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_happy_path_three_components() {
    let p1 = ScriptedLlm::healthy("insight");
    let h = harness(|d| {
        d.with_llm("llm.p1", p1.clone())
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");
    register_linear_pipeline(&h);

    let report = h.engine.run_synchronously(job()).await.unwrap();

    assert!(report.success);
    assert_eq!(report.metrics.success_rate, 1.0);
    let keys: Vec<&String> = report.components.keys().collect();
    assert_eq!(keys, vec!["avatar", "drivers", "web_search"]);
    assert!(
        report
            .components
            .values()
            .all(|c| c.status == ComponentStatus::Ok)
    );

    // Terminal snapshot: three steps, all done, status completed.
    let snapshot = h.engine.status(&report.session_id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    let progress = snapshot.last_progress.unwrap();
    assert_eq!(progress.step, 3);
    assert_eq!(progress.total_steps, 3);

    // Checkpoint order respects the dependency chain.
    let artifacts = h.store.list_artifacts(&report.session_id).unwrap();
    let stages: Vec<&str> = artifacts
        .iter()
        .map(|a| a.stage.as_str())
        .filter(|s| *s != "job_request" && *s != "consolidated_report")
        .collect();
    assert_eq!(stages, vec!["web_search", "avatar", "drivers"]);
}

// ── Scenario B: rate-limited primary, fallback succeeds ───────────────

#[tokio::test]
async fn scenario_b_rate_limited_primary_falls_back() {
    let p1 = ScriptedLlm::scripted(
        vec![Err(ProviderError::RateLimited {
            message: "429".into(),
        })],
        Some("p1 reply"),
    );
    let p2 = ScriptedLlm::healthy("p2 reply");
    let h = harness(|d| {
        d.with_llm("llm.p1", p1.clone())
            .with_llm("llm.p2", p2.clone())
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_llm(&h.providers, "llm.p2", 2);
    register_search(&h.providers, "search.s1");
    register_linear_pipeline(&h);

    let report = h.engine.run_synchronously(job()).await.unwrap();

    assert!(report.success);
    assert_eq!(report.metrics.success_rate, 1.0);
    // The avatar stage was served by the fallback provider.
    assert_eq!(report.components["avatar"].data["provider"], "llm.p2");

    // The 429 left the primary disabled with exactly one failure on record.
    let p1_entry = h.providers.get("llm.p1").unwrap();
    assert_eq!(p1_entry.consecutive_failures, 1);
    assert_eq!(p1_entry.state, ProviderState::Disabled);
    assert!(p1_entry.disabled_until.unwrap() > chrono::Utc::now());
    assert_eq!(p1.calls(), 1);
}

// ── Scenario C: required failure, optional dependent continues ────────

fn register_failure_pipeline(h: &Harness) -> Arc<AtomicU32> {
    h.components
        .register(ComponentDefinition::new(
            "web_search",
            Arc::new(SearchComponent {
                dispatcher: h.dispatcher.clone(),
            }),
        ))
        .unwrap();
    let (_, avatar) = LlmComponent::new(&h.dispatcher, "avatar");
    h.components
        .register(ComponentDefinition::new("avatar", avatar).with_dependencies(&["web_search"]))
        .unwrap();
    h.components
        .register(
            ComponentDefinition::new("drivers", Arc::new(FailingComponent))
                .with_dependencies(&["avatar"])
                .required(true),
        )
        .unwrap();
    let echo_calls = Arc::new(AtomicU32::new(0));
    h.components
        .register(
            ComponentDefinition::new(
                "pre_pitch",
                Arc::new(EchoComponent {
                    calls: echo_calls.clone(),
                }),
            )
            .with_dependencies(&["drivers"])
            .required(false),
        )
        .unwrap();
    echo_calls
}

#[tokio::test]
async fn scenario_c_required_failure_does_not_abort_the_run() {
    let h = harness(|d| {
        d.with_llm("llm.p1", ScriptedLlm::healthy("reply"))
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");
    let echo_calls = register_failure_pipeline(&h);

    let report = h.engine.run_synchronously(job()).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.failed_required, vec!["drivers"]);
    assert_eq!(report.components["drivers"].status, ComponentStatus::Error);

    // The optional dependent still ran, with the error sentinel visible.
    assert_eq!(echo_calls.load(Ordering::SeqCst), 1);
    let pre_pitch = &report.components["pre_pitch"];
    assert_eq!(pre_pitch.status, ComponentStatus::Ok);
    assert!(pre_pitch.data["seen"]["drivers"]["error"].is_string());

    let snapshot = h.engine.status(&report.session_id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Failed);
    assert!(snapshot.error.unwrap().contains("drivers"));
}

// ── Scenario D: pause between components, then resume ─────────────────

#[tokio::test]
async fn scenario_d_pause_then_resume() {
    let h = harness(|d| {
        d.with_llm("llm.p1", ScriptedLlm::healthy("reply"))
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");

    let mut counters = Vec::new();
    let mut previous: Option<String> = None;
    for name in ["stage_a", "stage_b", "stage_c", "stage_d", "stage_e"] {
        let calls = Arc::new(AtomicU32::new(0));
        counters.push(calls.clone());
        let mut definition = ComponentDefinition::new(
            name,
            Arc::new(SlowComponent {
                delay: Duration::from_millis(200),
                calls,
            }),
        );
        if let Some(dep) = &previous {
            definition = definition.with_dependencies(&[dep.as_str()]);
        }
        h.components.register(definition).unwrap();
        previous = Some(name.to_string());
    }

    let id = h.engine.submit(job()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.pause(&id).unwrap();

    wait_for_status(&h.engine, &id, SessionStatus::Paused).await;
    let paused = h.engine.status(&id).unwrap();
    // The in-flight component finished before the pause took effect.
    assert!(paused.completed_components >= 1);
    let stage_artifacts = h
        .store
        .list_artifacts(&id)
        .unwrap()
        .into_iter()
        .filter(|a| a.stage.starts_with("stage_"))
        .count();
    assert_eq!(stage_artifacts, paused.completed_components);

    h.engine.resume(&id).unwrap();
    let status = h.engine.wait_for_terminal(&id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    // Every stage ran exactly once across pause and resume.
    for calls in &counters {
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
    let final_stage_artifacts = h
        .store
        .list_artifacts(&id)
        .unwrap()
        .into_iter()
        .filter(|a| a.stage.starts_with("stage_"))
        .count();
    assert_eq!(final_stage_artifacts, 5);
}

// ── Scenario E: every LLM provider exhausted ──────────────────────────

#[tokio::test]
async fn scenario_e_all_llm_providers_exhausted() {
    let auth_fail = || {
        ScriptedLlm::scripted(
            vec![
                Err(ProviderError::Auth { message: "401".into() }),
                Err(ProviderError::Auth { message: "401".into() }),
                Err(ProviderError::Auth { message: "401".into() }),
            ],
            None,
        )
    };
    let h = harness(|d| {
        d.with_llm("llm.p1", auth_fail())
            .with_llm("llm.p2", auth_fail())
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_llm(&h.providers, "llm.p2", 2);
    register_search(&h.providers, "search.s1");

    // web_search does not need an LLM; the three analysis stages do.
    h.components
        .register(ComponentDefinition::new(
            "web_search",
            Arc::new(SearchComponent {
                dispatcher: h.dispatcher.clone(),
            }),
        ))
        .unwrap();
    for name in ["avatar", "drivers", "summary"] {
        let (_, component) = LlmComponent::new(&h.dispatcher, "analysis");
        h.components
            .register(
                ComponentDefinition::new(name, component)
                    .with_dependencies(&["web_search"])
                    .required(false),
            )
            .unwrap();
    }

    let report = h.engine.run_synchronously(job()).await.unwrap();

    // The search-only component still succeeded.
    assert_eq!(report.components["web_search"].status, ComponentStatus::Ok);

    // Each LLM stage errored with the exhaustion kind.
    for name in ["avatar", "drivers", "summary"] {
        let component = &report.components[name];
        assert_eq!(component.status, ComponentStatus::Error);
        assert_eq!(
            component.kind,
            Some(marketscope::errors::ErrorKind::AllProvidersExhausted)
        );
    }

    // After three consecutive auth failures each, every LLM provider is
    // disabled, and the report's snapshot says so.
    for name in ["llm.p1", "llm.p2"] {
        assert_eq!(h.providers.get(name).unwrap().state, ProviderState::Disabled);
        assert_eq!(report.provider_status[name]["state"], "disabled");
    }
}

// ── Scenario F: continue_from_persisted restores partial progress ─────

#[tokio::test]
async fn scenario_f_continue_restores_partial_progress() {
    let h = harness(|d| {
        d.with_llm("llm.p1", ScriptedLlm::healthy("reply"))
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");
    let echo_calls = register_failure_pipeline(&h);

    let report = h.engine.run_synchronously(job()).await.unwrap();
    let id = report.session_id.clone();
    assert!(!report.success);

    // Repair the failing component and continue the failed session.
    h.components
        .register(
            ComponentDefinition::new("drivers", Arc::new(EchoComponent {
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .with_dependencies(&["avatar"])
            .required(true),
        )
        .unwrap();

    h.engine.continue_from_persisted(&id).unwrap();
    let status = h.engine.wait_for_terminal(&id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let report = match h.engine.get_report(&id) {
        ReportState::Ready(report) => *report,
        other => panic!("expected report, got {other:?}"),
    };
    assert!(report.success);
    assert!(report.failed_required.is_empty());

    // Previously-successful components were reloaded, not re-executed.
    assert_eq!(
        report.components["web_search"].status,
        ComponentStatus::SkippedFromCheckpoint
    );
    assert_eq!(
        report.components["avatar"].status,
        ComponentStatus::SkippedFromCheckpoint
    );
    // The repaired component ran, and its downstream dependent re-ran.
    assert_eq!(report.components["drivers"].status, ComponentStatus::Ok);
    assert_eq!(report.components["pre_pitch"].status, ComponentStatus::Ok);
    assert_eq!(echo_calls.load(Ordering::SeqCst), 2);
}

// ── Cancellation bound ────────────────────────────────────────────────

#[tokio::test]
async fn cancel_stops_a_running_session() {
    let h = harness(|d| {
        d.with_llm("llm.p1", ScriptedLlm::healthy("reply"))
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");

    let calls = Arc::new(AtomicU32::new(0));
    h.components
        .register(ComponentDefinition::new(
            "slow_a",
            Arc::new(SlowComponent {
                delay: Duration::from_millis(300),
                calls: calls.clone(),
            }),
        ))
        .unwrap();
    let never_ran = Arc::new(AtomicU32::new(0));
    h.components
        .register(
            ComponentDefinition::new(
                "slow_b",
                Arc::new(SlowComponent {
                    delay: Duration::from_millis(300),
                    calls: never_ran.clone(),
                }),
            )
            .with_dependencies(&["slow_a"]),
        )
        .unwrap();

    let id = h.engine.submit(job()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.cancel(&id).unwrap();

    let status = h.engine.wait_for_terminal(&id).await.unwrap();
    assert_eq!(status, SessionStatus::Cancelled);
    assert_eq!(never_ran.load(Ordering::SeqCst), 0);

    // Terminal states are immutable: further transitions are refused.
    assert!(h.engine.pause(&id).is_err());
    assert!(h.engine.resume(&id).is_err());
    assert!(h.engine.cancel(&id).is_err());
}

// ── Report survives a process "restart" ───────────────────────────────

#[tokio::test]
async fn report_is_readable_from_checkpoints_alone() {
    let h = harness(|d| {
        d.with_llm("llm.p1", ScriptedLlm::healthy("reply"))
            .with_search("search.s1", Arc::new(HealthySearch))
    });
    register_llm(&h.providers, "llm.p1", 1);
    register_search(&h.providers, "search.s1");
    register_linear_pipeline(&h);

    let report = h.engine.run_synchronously(job()).await.unwrap();

    // A fresh engine over the same data dir (new in-memory state) can still
    // serve the persisted report.
    let fresh = Engine::with_parts(
        h.engine.config().clone(),
        Arc::new(ProviderRegistry::new()),
        h.store.clone(),
        Arc::new(ComponentRegistry::new()),
    );
    match fresh.get_report(&report.session_id) {
        ReportState::Ready(persisted) => {
            assert_eq!(persisted.session_id, report.session_id);
            assert!(persisted.success);
        }
        other => panic!("expected persisted report, got {other:?}"),
    }
}

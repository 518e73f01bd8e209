//! Layered configuration for the engine.
//!
//! Settings come from an optional `marketscope.toml` file overlaid by
//! environment variables (file → environment). Provider credentials are
//! environment-first: each recognised key variable becomes one registry
//! entry, so rotating Google search keys (`GOOGLE_SEARCH_KEY`,
//! `GOOGLE_SEARCH_KEY_1`, ...) each get their own health state, cooldown
//! and daily quota.
//!
//! A provider class with no configured credentials is disabled; the engine
//! refuses job submissions unless at least one LLM and one search provider
//! are present.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which adapter a credential entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Google Gemini generateContent API
    Gemini,
    /// Any OpenAI-compatible chat completions endpoint (OpenAI, Groq, DeepSeek)
    OpenAiCompatible,
    /// Google Custom Search JSON API
    GoogleSearch,
    /// Serper.dev search API
    Serper,
    /// Supadata-style social media search API
    SupadataSocial,
}

/// One named credential entry supplied from the environment or config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Registry name, e.g. `llm.gemini` or `search.google.key_1`
    pub name: String,
    pub adapter: AdapterKind,
    pub api_key: String,
    /// Lower is preferred
    pub priority: u32,
    /// Model name for LLM entries, search-engine id for Google entries
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint override for OpenAI-compatible entries
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub daily_quota: Option<u32>,
    /// Minimum seconds between successive calls
    #[serde(default)]
    pub min_interval_secs: Option<f64>,
}

impl CredentialEntry {
    fn new(name: &str, adapter: AdapterKind, api_key: String, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            adapter,
            api_key,
            priority,
            model: None,
            endpoint: None,
            daily_quota: None,
            min_interval_secs: None,
        }
    }

    fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    fn with_daily_quota(mut self, quota: u32) -> Self {
        self.daily_quota = Some(quota);
        self
    }

    fn with_min_interval(mut self, secs: f64) -> Self {
        self.min_interval_secs = Some(secs);
        self
    }
}

/// Deadlines and pacing defaults. All values are overridable per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard deadline for one LLM call
    pub llm_call_secs: u64,
    /// Hard deadline for one search or social call
    pub search_call_secs: u64,
    /// Per-strategy deadline in the extraction chain
    pub extract_strategy_secs: u64,
    /// Hard deadline for one component execution
    pub component_secs: u64,
    /// How long the dispatcher is willing to sleep on a rate-limiter wait
    pub dispatch_max_wait_ms: u64,
    /// Default gap between successive calls to one LLM provider
    pub llm_min_interval_secs: f64,
    /// Default gap between successive calls to one search provider
    pub search_min_interval_secs: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            llm_call_secs: 60,
            search_call_secs: 30,
            extract_strategy_secs: 15,
            component_secs: 600,
            dispatch_max_wait_ms: 2_000,
            llm_min_interval_secs: 1.0,
            search_min_interval_secs: 1.0,
        }
    }
}

impl LimitsConfig {
    pub fn llm_deadline(&self) -> Duration {
        Duration::from_secs(self.llm_call_secs)
    }

    pub fn search_deadline(&self) -> Duration {
        Duration::from_secs(self.search_call_secs)
    }

    pub fn extract_strategy_deadline(&self) -> Duration {
        Duration::from_secs(self.extract_strategy_secs)
    }

    pub fn component_deadline(&self) -> Duration {
        Duration::from_secs(self.component_secs)
    }

    pub fn dispatch_max_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch_max_wait_ms)
    }
}

/// What `submit` does when the concurrent-session cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Accept the job and let its executor wait for a free slot
    #[default]
    Queue,
    /// Refuse the submission outright
    Reject,
}

/// Engine configuration, fully resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Checkpoint-store root directory
    pub data_dir: PathBuf,
    pub max_concurrent_sessions: usize,
    #[serde(default)]
    pub capacity_policy: CapacityPolicy,
    /// When no social provider is live, emit a clearly-marked synthetic
    /// placeholder instead of an error. Off by default.
    #[serde(default)]
    pub allow_synthetic_fallback: bool,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Optional key for the reader-service extraction strategy
    #[serde(default)]
    pub reader_api_key: Option<String>,
    #[serde(default)]
    pub llm_providers: Vec<CredentialEntry>,
    #[serde(default)]
    pub search_providers: Vec<CredentialEntry>,
    #[serde(default)]
    pub social_providers: Vec<CredentialEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/analyses"),
            max_concurrent_sessions: 4,
            capacity_policy: CapacityPolicy::default(),
            allow_synthetic_fallback: false,
            limits: LimitsConfig::default(),
            reader_api_key: None,
            llm_providers: Vec::new(),
            search_providers: Vec::new(),
            social_providers: Vec::new(),
        }
    }
}

/// Partial file representation; every field optional so the file can set
/// only what it cares about.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    max_concurrent_sessions: Option<usize>,
    capacity_policy: Option<CapacityPolicy>,
    allow_synthetic_fallback: Option<bool>,
    limits: Option<LimitsConfig>,
    #[serde(default)]
    llm_providers: Vec<CredentialEntry>,
    #[serde(default)]
    search_providers: Vec<CredentialEntry>,
    #[serde(default)]
    social_providers: Vec<CredentialEntry>,
}

impl Config {
    /// Load configuration: defaults, then the file (if present), then the
    /// environment on top.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = file
            && path.exists()
        {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let parsed: ConfigFile = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            config.apply_file(parsed);
        }

        config.apply_env();
        Ok(config)
    }

    /// Environment-only load, used by the `serve` entry point when no
    /// config file is given.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    pub fn has_required_providers(&self) -> bool {
        !self.llm_providers.is_empty() && !self.search_providers.is_empty()
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }
        if let Some(max) = file.max_concurrent_sessions {
            self.max_concurrent_sessions = max;
        }
        if let Some(policy) = file.capacity_policy {
            self.capacity_policy = policy;
        }
        if let Some(allow) = file.allow_synthetic_fallback {
            self.allow_synthetic_fallback = allow;
        }
        if let Some(limits) = file.limits {
            self.limits = limits;
        }
        self.llm_providers.extend(file.llm_providers);
        self.search_providers.extend(file.search_providers);
        self.social_providers.extend(file.social_providers);
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("MARKETSCOPE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(max) = env_parse::<usize>("MARKETSCOPE_MAX_SESSIONS") {
            self.max_concurrent_sessions = max.max(1);
        }
        if let Some(reject) = env_parse::<bool>("MARKETSCOPE_REJECT_ON_CAPACITY") {
            self.capacity_policy = if reject {
                CapacityPolicy::Reject
            } else {
                CapacityPolicy::Queue
            };
        }
        if let Some(allow) = env_parse::<bool>("MARKETSCOPE_ALLOW_SYNTHETIC_FALLBACK") {
            self.allow_synthetic_fallback = allow;
        }
        if let Ok(key) = std::env::var("JINA_API_KEY") {
            self.reader_api_key = Some(key);
        }

        self.apply_llm_env();
        self.apply_search_env();
        self.apply_social_env();
    }

    fn apply_llm_env(&mut self) {
        let interval = self.limits.llm_min_interval_secs;

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.push_llm(
                CredentialEntry::new("llm.gemini", AdapterKind::Gemini, key, 1)
                    .with_model("gemini-2.0-flash")
                    .with_min_interval(interval),
            );
        }
        if let Ok(key) = std::env::var("GROQ_API_KEY") {
            self.push_llm(
                CredentialEntry::new("llm.groq", AdapterKind::OpenAiCompatible, key, 2)
                    .with_endpoint("https://api.groq.com/openai/v1")
                    .with_model("llama3-70b-8192")
                    .with_min_interval(interval),
            );
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.push_llm(
                CredentialEntry::new("llm.openai", AdapterKind::OpenAiCompatible, key, 3)
                    .with_endpoint("https://api.openai.com/v1")
                    .with_model("gpt-4o-mini")
                    .with_min_interval(interval),
            );
        }
        if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
            self.push_llm(
                CredentialEntry::new("llm.deepseek", AdapterKind::OpenAiCompatible, key, 4)
                    .with_endpoint("https://api.deepseek.com/v1")
                    .with_model("deepseek-chat")
                    .with_min_interval(interval),
            );
        }
    }

    fn apply_search_env(&mut self) {
        let interval = self.limits.search_min_interval_secs;

        // Rotating Google keys: GOOGLE_SEARCH_KEY, GOOGLE_SEARCH_KEY_1, ...
        // each paired with GOOGLE_CSE_ID (or GOOGLE_CSE_ID_{n}).
        let base_cse = std::env::var("GOOGLE_CSE_ID").ok();
        for (suffix, key_var) in google_key_vars() {
            let Ok(key) = std::env::var(&key_var) else {
                continue;
            };
            let cse = std::env::var(format!("GOOGLE_CSE_ID{suffix}"))
                .ok()
                .or_else(|| base_cse.clone());
            let Some(cse) = cse else {
                continue;
            };
            let name = format!("search.google.key{}", if suffix.is_empty() { "_0" } else { suffix.as_str() });
            self.push_search(
                CredentialEntry::new(&name, AdapterKind::GoogleSearch, key, 1)
                    .with_model(&cse)
                    .with_daily_quota(100)
                    .with_min_interval(interval),
            );
        }

        if let Ok(key) = std::env::var("SERPER_API_KEY") {
            self.push_search(
                CredentialEntry::new("search.serper", AdapterKind::Serper, key, 2)
                    .with_daily_quota(2_500)
                    .with_min_interval(0.5),
            );
        }
    }

    fn apply_social_env(&mut self) {
        if let Ok(key) = std::env::var("SUPADATA_API_KEY") {
            let mut entry =
                CredentialEntry::new("social.supadata", AdapterKind::SupadataSocial, key, 1)
                    .with_min_interval(1.0);
            if let Ok(url) = std::env::var("SUPADATA_API_URL") {
                entry = entry.with_endpoint(&url);
            }
            self.push_social(entry);
        }
    }

    fn push_llm(&mut self, entry: CredentialEntry) {
        if !self.llm_providers.iter().any(|e| e.name == entry.name) {
            self.llm_providers.push(entry);
        }
    }

    fn push_search(&mut self, entry: CredentialEntry) {
        if !self.search_providers.iter().any(|e| e.name == entry.name) {
            self.search_providers.push(entry);
        }
    }

    fn push_social(&mut self, entry: CredentialEntry) {
        if !self.social_providers.iter().any(|e| e.name == entry.name) {
            self.social_providers.push(entry);
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn google_key_vars() -> Vec<(String, String)> {
    let mut vars = vec![(String::new(), "GOOGLE_SEARCH_KEY".to_string())];
    for n in 1..=4 {
        vars.push((format!("_{n}"), format!("GOOGLE_SEARCH_KEY_{n}")));
    }
    vars
}

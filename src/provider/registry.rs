//! Health and priority bookkeeping for named provider credentials.
//!
//! One registry instance is shared by every session. All mutations happen
//! under a single mutex; reads return snapshots so callers never hold the
//! lock across a network call.

use crate::errors::ErrorKind;
use crate::provider::ProviderClass;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Cooldown base for rate-limit failures.
const RATE_LIMIT_BACKOFF_BASE_SECS: u64 = 120;
/// Cooldown base for generic failures.
const GENERIC_BACKOFF_BASE_SECS: u64 = 30;
/// Ceiling for any cooldown: a long-broken key still retries hourly.
const BACKOFF_CAP_SECS: u64 = 3_600;
/// Consecutive generic failures before an entry is disabled.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Exponential backoff with a one-hour cap.
pub fn backoff_secs(kind: ErrorKind, failures: u32) -> u64 {
    let base = match kind {
        ErrorKind::RateLimited => RATE_LIMIT_BACKOFF_BASE_SECS,
        _ => GENERIC_BACKOFF_BASE_SECS,
    };
    (base * 2u64.pow(failures.min(6))).min(BACKOFF_CAP_SECS)
}

/// Health state of one provider entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Healthy,
    Degraded,
    Disabled,
}

/// One named credential with its live health counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEntry {
    pub name: String,
    pub class: ProviderClass,
    pub priority: u32,
    /// Model name or rotating sub-key index, for classes that carry one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub state: ProviderState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_until: Option<DateTime<Utc>>,
    pub requests_today: u32,
    pub day_bucket_start: NaiveDate,
}

impl ProviderEntry {
    pub fn new(name: &str, class: ProviderClass, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            class,
            priority,
            model: None,
            state: ProviderState::Healthy,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            disabled_until: None,
            requests_today: 0,
            day_bucket_start: Utc::now().date_naive(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Whether a call may be issued right now.
    fn is_callable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ProviderState::Healthy | ProviderState::Degraded => true,
            ProviderState::Disabled => self.disabled_until.is_none_or(|until| until <= now),
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if self.day_bucket_start != today {
            self.day_bucket_start = today;
            self.requests_today = 0;
        }
    }
}

/// Shared registry of provider entries across all classes.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: Mutex<HashMap<String, ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) an entry. Called at startup from config.
    pub fn register(&self, entry: ProviderEntry) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.insert(entry.name.clone(), entry);
    }

    /// Entries of a class that may be called now, sorted by
    /// `(priority, consecutive_failures, name)` ascending. An expired
    /// cooldown re-enters the pool healthy.
    pub fn list_available(&self, class: ProviderClass) -> Vec<ProviderEntry> {
        self.list_available_at(class, Utc::now())
    }

    pub fn list_available_at(&self, class: ProviderClass, now: DateTime<Utc>) -> Vec<ProviderEntry> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let mut available: Vec<ProviderEntry> = inner
            .values_mut()
            .filter(|e| e.class == class)
            .filter_map(|e| {
                if e.state == ProviderState::Disabled && e.is_callable(now) {
                    // Cooldown elapsed: re-probe.
                    e.state = ProviderState::Healthy;
                    e.disabled_until = None;
                    tracing::info!(provider = %e.name, "cooldown expired, provider re-enabled");
                }
                e.is_callable(now).then(|| e.clone())
            })
            .collect();
        available.sort_by(|a, b| {
            (a.priority, a.consecutive_failures, a.name.as_str())
                .cmp(&(b.priority, b.consecutive_failures, b.name.as_str()))
        });
        available
    }

    /// Record a successful call: the entry returns to healthy and its
    /// daily counter advances.
    pub fn record_success(&self, name: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(entry) = inner.get_mut(name) {
            entry.roll_day(Utc::now().date_naive());
            entry.state = ProviderState::Healthy;
            entry.consecutive_failures = 0;
            entry.total_successes += 1;
            entry.requests_today += 1;
            entry.disabled_until = None;
        }
    }

    /// Record a failed call. Rate limits disable immediately with the long
    /// backoff; other kinds disable after `MAX_CONSECUTIVE_FAILURES`.
    pub fn record_failure(&self, name: &str, kind: ErrorKind) {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(entry) = inner.get_mut(name) else {
            return;
        };
        entry.consecutive_failures += 1;
        entry.total_failures += 1;

        let cooldown = backoff_secs(kind, entry.consecutive_failures);
        match kind {
            ErrorKind::RateLimited => {
                entry.state = ProviderState::Disabled;
                entry.disabled_until = Some(now + chrono::Duration::seconds(cooldown as i64));
                tracing::warn!(provider = name, cooldown_secs = cooldown, "provider rate limited");
            }
            _ if entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES => {
                entry.state = ProviderState::Disabled;
                entry.disabled_until = Some(now + chrono::Duration::seconds(cooldown as i64));
                tracing::warn!(
                    provider = name,
                    failures = entry.consecutive_failures,
                    cooldown_secs = cooldown,
                    "provider disabled after repeated failures"
                );
            }
            _ => {
                entry.state = ProviderState::Degraded;
            }
        }
    }

    /// Re-enable every entry whose cooldown has passed.
    pub fn rehabilitate_expired(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for entry in inner.values_mut() {
            if entry.state == ProviderState::Disabled
                && entry.disabled_until.is_none_or(|until| until <= now)
            {
                entry.state = ProviderState::Healthy;
                entry.disabled_until = None;
            }
        }
    }

    /// Administrative reset of one entry, or all when `name` is `None`.
    pub fn reset(&self, name: Option<&str>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let reset_one = |entry: &mut ProviderEntry| {
            entry.state = ProviderState::Healthy;
            entry.consecutive_failures = 0;
            entry.disabled_until = None;
        };
        match name {
            Some(name) => {
                if let Some(entry) = inner.get_mut(name) {
                    reset_one(entry);
                }
            }
            None => inner.values_mut().for_each(reset_one),
        }
    }

    /// Defensive snapshot of every entry, for reports and status endpoints.
    pub fn snapshot(&self) -> BTreeMap<String, ProviderEntry> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Look up a single entry by name.
    pub fn get(&self, name: &str) -> Option<ProviderEntry> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(name).cloned()
    }

    /// Count of callable entries per class, for the report's health block.
    pub fn health_by_class(&self) -> BTreeMap<String, usize> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut health: BTreeMap<String, usize> = BTreeMap::new();
        for entry in inner.values() {
            let bucket = health.entry(entry.class.to_string()).or_default();
            if entry.is_callable(now) {
                *bucket += 1;
            }
        }
        health
    }
}

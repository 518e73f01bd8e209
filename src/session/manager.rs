//! Session lifecycle: creation, pause/resume, cancellation, continuation
//! from persisted artifacts, and terminal-state bookkeeping.
//!
//! Each session runs on its own tokio task; the manager enforces at most
//! one executor per session id and a configurable cap on concurrent
//! executors. State transitions only happen here, and every transition is
//! backed by the checkpoint store before a terminal status is published.

use crate::analysis::context::JobRequest;
use crate::checkpoint::{ArtifactStatus, CheckpointStore, SessionSummary, categories};
use crate::config::CapacityPolicy;
use crate::errors::SessionError;
use crate::pipeline::component::{ComponentOutcome, ComponentRegistry};
use crate::pipeline::normalize::{self, FinalReport};
use crate::pipeline::runner::{Halt, PipelineRunner, RunContext};
use crate::provider::registry::ProviderRegistry;
use crate::session::progress::{ProgressEvent, ProgressPublisher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle states. `Completed`, `Failed` and `Cancelled` are terminal:
/// no further transition mutates such a session (continuation starts a
/// fresh run over the same persisted artifacts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Read-only view served by status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_components: usize,
    pub total_components: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<ProgressEvent>,
}

/// What `get_report` found.
#[derive(Debug)]
pub enum ReportState {
    Ready(Box<FinalReport>),
    Pending,
    NotFound,
}

struct SessionRecord {
    id: String,
    job: JobRequest,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    resumed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    report: Option<FinalReport>,
    outcomes: BTreeMap<String, ComponentOutcome>,
    pause: Arc<AtomicBool>,
    cancel: CancellationToken,
    progress: ProgressPublisher,
    status_tx: watch::Sender<SessionStatus>,
    executor_running: bool,
}

impl SessionRecord {
    fn new(id: &str, job: JobRequest) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Running);
        Self {
            id: id.to_string(),
            job,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            error: None,
            report: None,
            outcomes: BTreeMap::new(),
            pause: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            progress: ProgressPublisher::new(id),
            status_tx,
            executor_running: false,
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        let _ = self.status_tx.send(status);
    }

    fn snapshot(&self, total_components: usize) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            paused_at: self.paused_at,
            resumed_at: self.resumed_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            completed_components: self.outcomes.values().filter(|o| o.is_ok()).count(),
            total_components,
            last_progress: self.progress.latest(),
        }
    }
}

/// Owns every live session and the executor tasks driving them.
pub struct SessionManager {
    store: Arc<CheckpointStore>,
    provider_registry: Arc<ProviderRegistry>,
    components: Arc<ComponentRegistry>,
    runner: Arc<PipelineRunner>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    slots: Arc<Semaphore>,
    capacity_policy: CapacityPolicy,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(
        store: Arc<CheckpointStore>,
        provider_registry: Arc<ProviderRegistry>,
        components: Arc<ComponentRegistry>,
        runner: Arc<PipelineRunner>,
        max_sessions: usize,
        capacity_policy: CapacityPolicy,
    ) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            store,
            provider_registry,
            components,
            runner,
            sessions: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_sessions)),
            capacity_policy,
            max_sessions,
        }
    }

    /// Create a session and start executing asynchronously. Returns the new
    /// session id immediately.
    pub fn start(self: &Arc<Self>, job: JobRequest) -> Result<String, SessionError> {
        job.validate().map_err(SessionError::InvalidRequest)?;

        if self.capacity_policy == CapacityPolicy::Reject && self.slots.available_permits() == 0 {
            return Err(SessionError::CapacityExhausted(self.max_sessions));
        }

        let id = new_session_id();
        let job_value =
            serde_json::to_value(&job).map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
        self.store.append(
            &id,
            "job_request",
            categories::LOGS,
            ArtifactStatus::Ok,
            job_value,
        )?;

        {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            sessions.insert(id.clone(), SessionRecord::new(&id, job));
        }
        tracing::info!(session = %id, "session created");
        self.spawn_run(&id, false)?;
        Ok(id)
    }

    /// Request a cooperative pause. The scheduler observes the flag between
    /// components; the status flips to `paused` once the in-flight
    /// component finishes.
    pub fn pause(&self, id: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        let record = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if record.status != SessionStatus::Running {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                action: "pause",
                status: record.status.to_string(),
            });
        }
        record.pause.store(true, Ordering::SeqCst);
        tracing::info!(session = %id, "pause requested");
        Ok(())
    }

    /// Resume a paused session from the next pending component.
    pub fn resume(self: &Arc<Self>, id: &str) -> Result<(), SessionError> {
        {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            let record =
                sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if record.status != SessionStatus::Paused {
                return Err(SessionError::InvalidTransition {
                    id: id.to_string(),
                    action: "resume",
                    status: record.status.to_string(),
                });
            }
            record.pause.store(false, Ordering::SeqCst);
            record.resumed_at = Some(Utc::now());
            record.set_status(SessionStatus::Running);
        }
        tracing::info!(session = %id, "session resumed");
        self.spawn_run(id, true)
    }

    /// Re-run a terminal session, reloading every checkpointed success and
    /// executing only what is missing or previously failed.
    pub fn continue_from_persisted(self: &Arc<Self>, id: &str) -> Result<(), SessionError> {
        let known_in_memory = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            match sessions.get_mut(id) {
                Some(record) => {
                    if !record.status.is_terminal() {
                        return Err(SessionError::InvalidTransition {
                            id: id.to_string(),
                            action: "continue",
                            status: record.status.to_string(),
                        });
                    }
                    // Fresh lifecycle on the same id: checkpoints decide
                    // what actually re-executes.
                    record.outcomes.clear();
                    record.report = None;
                    record.error = None;
                    record.completed_at = None;
                    record.resumed_at = Some(Utc::now());
                    record.pause.store(false, Ordering::SeqCst);
                    record.cancel = CancellationToken::new();
                    record.set_status(SessionStatus::Running);
                    true
                }
                None => false,
            }
        };

        if !known_in_memory {
            // Unknown to this process: rebuild the session from its
            // persisted job request.
            let artifact = self.store.load_artifact(id, "job_request")?;
            let job: JobRequest = serde_json::from_value(artifact.payload)
                .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            sessions.insert(id.to_string(), SessionRecord::new(id, job));
        }

        tracing::info!(session = %id, "continuing from persisted artifacts");
        self.spawn_run(id, true)
    }

    /// Cancel any non-terminal session. A paused session flips immediately;
    /// a running one stops at its next suspension point.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let record = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                action: "cancel",
                status: record.status.to_string(),
            });
        }
        record.cancel.cancel();
        if record.status == SessionStatus::Paused && !record.executor_running {
            record.set_status(SessionStatus::Cancelled);
            record.completed_at = Some(Utc::now());
        }
        tracing::info!(session = %id, "cancellation requested");
        Ok(())
    }

    /// Status snapshot for one session.
    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.get(id).map(|r| r.snapshot(self.components.len()))
    }

    /// The consolidated report, if the session reached one.
    pub fn report(&self, id: &str) -> ReportState {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get(id) {
            Some(record) => match &record.report {
                Some(report) => ReportState::Ready(Box::new(report.clone())),
                None => ReportState::Pending,
            },
            None => ReportState::NotFound,
        }
    }

    pub fn latest_progress(&self, id: &str) -> Option<ProgressEvent> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.get(id).and_then(|r| r.progress.latest())
    }

    /// Live progress stream for one session.
    pub fn subscribe(&self, id: &str) -> Option<tokio::sync::broadcast::Receiver<ProgressEvent>> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.get(id).map(|r| r.progress.subscribe())
    }

    /// Live and persisted sessions, in-memory state preferred.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut persisted = self.store.list_sessions();
        let sessions = self.sessions.lock().expect("session lock poisoned");
        for id in sessions.keys() {
            if !persisted.iter().any(|s| &s.session_id == id) {
                persisted.push(SessionSummary {
                    session_id: id.clone(),
                    artifact_count: 0,
                    categories: Vec::new(),
                    last_update: None,
                });
            }
        }
        persisted
    }

    /// Delete a session and all its artifacts. Refused while an executor
    /// is live.
    pub fn delete(&self, id: &str) -> Result<(), SessionError> {
        let removed = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            if let Some(record) = sessions.get(id) {
                if record.executor_running {
                    return Err(SessionError::AlreadyRunning(id.to_string()));
                }
                sessions.remove(id);
                true
            } else {
                false
            }
        };
        match self.store.delete(id) {
            Ok(()) => Ok(()),
            Err(crate::errors::StorageError::SessionNotFound(_)) if removed => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every idle session. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let ids: Vec<String> = self.list().into_iter().map(|s| s.session_id).collect();
        ids.iter().filter(|id| self.delete(id).is_ok()).count()
    }

    /// Block until the session reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<SessionStatus, SessionError> {
        let mut rx = {
            let sessions = self.sessions.lock().expect("session lock poisoned");
            let record = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record.status);
            }
            record.status_tx.subscribe()
        };
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::NotFound(id.to_string()));
            }
        }
    }

    /// Spawn the single executor task for a session.
    fn spawn_run(self: &Arc<Self>, id: &str, resume: bool) -> Result<(), SessionError> {
        let ctx = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            let record = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if record.executor_running {
                return Err(SessionError::AlreadyRunning(id.to_string()));
            }
            record.executor_running = true;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
            RunContext {
                session_id: record.id.clone(),
                job: record.job.clone(),
                resume,
                seed: record.outcomes.clone(),
                pause: record.pause.clone(),
                cancel: record.cancel.clone(),
                progress: record.progress.clone(),
            }
        };

        let manager = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let _permit = manager.slots.clone().acquire_owned().await;
            let started = Instant::now();
            let result = manager.runner.run(&ctx).await;
            manager.finish_run(&id, result, started.elapsed().as_secs_f64());
        });
        Ok(())
    }

    /// Apply the run result to the session record. The consolidated report
    /// is checkpointed before the terminal status is published; nothing is
    /// appended after a session turns terminal.
    fn finish_run(
        &self,
        id: &str,
        result: Result<crate::pipeline::runner::RunOutcome, crate::errors::StorageError>,
        elapsed_secs: f64,
    ) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let Some(record) = sessions.get_mut(id) else {
            return;
        };
        record.executor_running = false;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(session = %id, error = %err, "checkpointing failed, session failed");
                record.error = Some(err.to_string());
                record.completed_at = Some(Utc::now());
                record.set_status(SessionStatus::Failed);
                return;
            }
        };

        record.outcomes.extend(outcome.outcomes);

        match outcome.halted {
            Some(Halt::Paused) => {
                record.pause.store(false, Ordering::SeqCst);
                record.paused_at = Some(Utc::now());
                record.set_status(SessionStatus::Paused);
                tracing::info!(session = %id, "session paused");
            }
            Some(Halt::Cancelled) => {
                record.completed_at = Some(Utc::now());
                record.set_status(SessionStatus::Cancelled);
                tracing::info!(session = %id, "session cancelled");
            }
            None => {
                let registered = self.components.execution_order();
                let required: BTreeMap<String, bool> = registered
                    .iter()
                    .filter_map(|name| self.components.get(name).map(|c| (name.clone(), c.required)))
                    .collect();
                let provider_status = serde_json::to_value(self.provider_registry.snapshot())
                    .unwrap_or_default();
                let service_health =
                    serde_json::to_value(self.provider_registry.health_by_class()).unwrap_or_default();

                let report = normalize::consolidate(
                    id,
                    &registered,
                    &required,
                    &record.outcomes,
                    provider_status,
                    service_health,
                    elapsed_secs,
                );

                let report_value = serde_json::to_value(&report).unwrap_or_default();
                if let Err(err) = self.store.append(
                    id,
                    "consolidated_report",
                    categories::ANALYSIS,
                    ArtifactStatus::Ok,
                    report_value,
                ) {
                    tracing::error!(session = %id, error = %err, "failed to persist report");
                    record.error = Some(err.to_string());
                    record.completed_at = Some(Utc::now());
                    record.set_status(SessionStatus::Failed);
                    return;
                }

                let failed_required = report.failed_required.clone();
                let success = report.success;
                record.report = Some(report);
                record.completed_at = Some(Utc::now());
                if success {
                    record.set_status(SessionStatus::Completed);
                    tracing::info!(session = %id, "session completed");
                } else {
                    record.error = Some(format!(
                        "required components failed: {}",
                        failed_required.join(", ")
                    ));
                    record.set_status(SessionStatus::Failed);
                    tracing::warn!(session = %id, ?failed_required, "session failed");
                }
            }
        }
    }
}

fn new_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let tail = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{stamp}_{}", &tail[..8])
}

//! Append-only artifact log backing pause/resume and post-hoc inspection.
//!
//! Every intermediate output of a session is written as one self-describing
//! JSON document under `{root}/{category}/{session_id}/{seq}_{stage}.json`.
//! Artifacts are never mutated after the write; "latest write wins" applies
//! per stage name when a session is reloaded. Deleting a session removes
//! every artifact it produced, across categories.

use crate::errors::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use walkdir::WalkDir;

/// Coarse storage buckets, one directory per category.
pub mod categories {
    pub const ANALYSIS: &str = "complete_analysis";
    pub const WEB_SEARCH: &str = "web_search";
    pub const LOGS: &str = "logs";
}

/// Write status recorded on every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Ok,
    FallbackUsed,
    Error,
}

/// One persisted record of a stage's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: String,
    pub category: String,
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub status: ArtifactStatus,
    pub payload: serde_json::Value,
}

/// Lightweight listing entry, payload omitted.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDescriptor {
    pub stage: String,
    pub category: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub status: ArtifactStatus,
    pub path: PathBuf,
}

/// Summary of one persisted session, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub artifact_count: usize,
    pub categories: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Append-only artifact store rooted at one directory.
///
/// Sequence numbers are monotonic within a session and survive process
/// restarts: the counter is recovered from disk on first use.
pub struct CheckpointStore {
    root: PathBuf,
    sequences: Mutex<HashMap<String, u64>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durably write one artifact. Returns only after the bytes are on disk;
    /// any I/O failure propagates as [`StorageError`] and must be treated as
    /// fatal by the caller.
    pub fn append(
        &self,
        session_id: &str,
        stage: &str,
        category: &str,
        status: ArtifactStatus,
        payload: serde_json::Value,
    ) -> Result<Artifact, StorageError> {
        let sequence = self.next_sequence(session_id);
        let artifact = Artifact {
            stage: stage.to_string(),
            category: category.to_string(),
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            status,
            payload,
        };

        let dir = self.root.join(category).join(session_id);
        fs::create_dir_all(&dir).map_err(|source| StorageError::WriteFailed {
            session: session_id.to_string(),
            stage: stage.to_string(),
            source,
        })?;

        let file_name = format!("{:04}_{}.json", sequence, sanitize_stage(stage));
        let path = dir.join(file_name);
        let bytes = serde_json::to_vec_pretty(&artifact).map_err(|source| StorageError::Encode {
            stage: stage.to_string(),
            source,
        })?;

        let mut file = fs::File::create(&path).map_err(|source| StorageError::WriteFailed {
            session: session_id.to_string(),
            stage: stage.to_string(),
            source,
        })?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|source| StorageError::WriteFailed {
                session: session_id.to_string(),
                stage: stage.to_string(),
                source,
            })?;

        tracing::debug!(session = session_id, stage, sequence, "artifact appended");
        Ok(artifact)
    }

    /// All artifacts of a session across categories, ordered by sequence.
    pub fn list_artifacts(&self, session_id: &str) -> Result<Vec<ArtifactDescriptor>, StorageError> {
        let mut descriptors = Vec::new();
        for (path, artifact) in self.session_files(session_id)? {
            descriptors.push(ArtifactDescriptor {
                stage: artifact.stage,
                category: artifact.category,
                sequence: artifact.sequence,
                timestamp: artifact.timestamp,
                status: artifact.status,
                path,
            });
        }
        descriptors.sort_by_key(|d| d.sequence);
        Ok(descriptors)
    }

    /// The most recent artifact for a stage; latest write wins.
    pub fn load_artifact(&self, session_id: &str, stage: &str) -> Result<Artifact, StorageError> {
        let mut newest: Option<Artifact> = None;
        for (_, artifact) in self.session_files(session_id)? {
            if artifact.stage == stage
                && newest.as_ref().is_none_or(|a| artifact.sequence > a.sequence)
            {
                newest = Some(artifact);
            }
        }
        newest.ok_or_else(|| StorageError::ArtifactNotFound {
            session: session_id.to_string(),
            stage: stage.to_string(),
        })
    }

    /// Every session with at least one artifact, newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: HashMap<String, SessionSummary> = HashMap::new();

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            let category = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let summary = sessions.entry(session_id.clone()).or_insert_with(|| SessionSummary {
                session_id,
                artifact_count: 0,
                categories: Vec::new(),
                last_update: None,
            });
            if !summary.categories.contains(&category) {
                summary.categories.push(category);
            }
            for file in WalkDir::new(entry.path()).min_depth(1).max_depth(1) {
                let Ok(file) = file else { continue };
                if !is_artifact_file(file.path()) {
                    continue;
                }
                summary.artifact_count += 1;
                if let Ok(meta) = file.metadata()
                    && let Ok(modified) = meta.modified()
                {
                    let modified: DateTime<Utc> = modified.into();
                    if summary.last_update.is_none_or(|t| modified > t) {
                        summary.last_update = Some(modified);
                    }
                }
            }
        }

        let mut list: Vec<SessionSummary> =
            sessions.into_values().filter(|s| s.artifact_count > 0).collect();
        list.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        list
    }

    /// Per-category artifact counts for one session.
    pub fn session_summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.list_sessions().into_iter().find(|s| s.session_id == session_id)
    }

    /// Remove every artifact of one session, across categories.
    pub fn delete(&self, session_id: &str) -> Result<(), StorageError> {
        let mut removed_any = false;
        for category in self.category_dirs() {
            let dir = category.join(session_id);
            if dir.is_dir() {
                fs::remove_dir_all(&dir).map_err(|source| StorageError::ReadFailed {
                    path: dir.clone(),
                    source,
                })?;
                removed_any = true;
            }
        }
        self.sequences.lock().expect("sequence lock poisoned").remove(session_id);
        if removed_any {
            Ok(())
        } else {
            Err(StorageError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Remove sessions whose newest artifact is older than `max_age`.
    /// Returns the ids that were deleted.
    pub fn delete_older_than(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut deleted = Vec::new();
        for summary in self.list_sessions() {
            let stale = summary.last_update.is_none_or(|t| t < cutoff);
            if stale && self.delete(&summary.session_id).is_ok() {
                deleted.push(summary.session_id);
            }
        }
        deleted
    }

    /// Remove everything. Used by the `/sessions/clear` endpoint.
    pub fn delete_all(&self) -> usize {
        let sessions = self.list_sessions();
        let mut count = 0;
        for summary in sessions {
            if self.delete(&summary.session_id).is_ok() {
                count += 1;
            }
        }
        count
    }

    fn next_sequence(&self, session_id: &str) -> u64 {
        let mut sequences = self.sequences.lock().expect("sequence lock poisoned");
        let next = sequences
            .entry(session_id.to_string())
            .or_insert_with(|| self.max_sequence_on_disk(session_id) + 1);
        let current = *next;
        *next += 1;
        current
    }

    fn max_sequence_on_disk(&self, session_id: &str) -> u64 {
        let mut max = 0;
        for category in self.category_dirs() {
            let dir = category.join(session_id);
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let Ok(entry) = entry else { continue };
                if let Some(seq) = parse_sequence(entry.path()) {
                    max = max.max(seq);
                }
            }
        }
        max
    }

    fn category_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .collect()
    }

    fn session_files(
        &self,
        session_id: &str,
    ) -> Result<Vec<(PathBuf, Artifact)>, StorageError> {
        let mut files = Vec::new();
        for category in self.category_dirs() {
            let dir = category.join(session_id);
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let Ok(entry) = entry else { continue };
                let path = entry.path().to_path_buf();
                if !is_artifact_file(&path) {
                    continue;
                }
                let raw = fs::read_to_string(&path).map_err(|source| StorageError::ReadFailed {
                    path: path.clone(),
                    source,
                })?;
                let artifact: Artifact =
                    serde_json::from_str(&raw).map_err(|source| StorageError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                files.push((path, artifact));
            }
        }
        if files.is_empty() {
            return Err(StorageError::SessionNotFound(session_id.to_string()));
        }
        Ok(files)
    }
}

fn is_artifact_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
}

fn parse_sequence(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .split('_')
        .next()?
        .parse()
        .ok()
}

fn sanitize_stage(stage: &str) -> String {
    stage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn append_then_load_round_trips() {
        let (_dir, store) = store();
        store
            .append("s1", "web_search", categories::ANALYSIS, ArtifactStatus::Ok, json!({"hits": 3}))
            .unwrap();

        let artifact = store.load_artifact("s1", "web_search").unwrap();
        assert_eq!(artifact.payload["hits"], 3);
        assert_eq!(artifact.sequence, 1);
        assert_eq!(artifact.status, ArtifactStatus::Ok);
    }

    #[test]
    fn load_before_any_append_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_artifact("missing", "stage"),
            Err(StorageError::SessionNotFound(_))
        ));
    }

    #[test]
    fn latest_write_wins_per_stage() {
        let (_dir, store) = store();
        store
            .append("s1", "avatar", categories::ANALYSIS, ArtifactStatus::Error, json!({"v": 1}))
            .unwrap();
        store
            .append("s1", "avatar", categories::ANALYSIS, ArtifactStatus::Ok, json!({"v": 2}))
            .unwrap();

        let artifact = store.load_artifact("s1", "avatar").unwrap();
        assert_eq!(artifact.payload["v"], 2);
        assert_eq!(artifact.sequence, 2);
    }

    #[test]
    fn list_artifacts_is_ordered_by_sequence() {
        let (_dir, store) = store();
        for stage in ["a", "b", "c"] {
            store
                .append("s1", stage, categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
                .unwrap();
        }
        let listed = store.list_artifacts("s1").unwrap();
        let sequences: Vec<u64> = listed.iter().map(|d| d.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(listed[0].stage, "a");
        assert_eq!(listed[2].stage, "c");
    }

    #[test]
    fn sequences_span_categories() {
        let (_dir, store) = store();
        store
            .append("s1", "job_request", categories::LOGS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        store
            .append("s1", "web_search", categories::WEB_SEARCH, ArtifactStatus::Ok, json!({}))
            .unwrap();
        let listed = store.list_artifacts("s1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].sequence, 2);
    }

    #[test]
    fn sequence_counter_recovers_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = CheckpointStore::new(dir.path());
            store
                .append("s1", "a", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
                .unwrap();
            store
                .append("s1", "b", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
                .unwrap();
        }
        // Fresh store over the same root continues the numbering.
        let store = CheckpointStore::new(dir.path());
        let artifact = store
            .append("s1", "c", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        assert_eq!(artifact.sequence, 3);
    }

    #[test]
    fn list_sessions_reports_counts_and_categories() {
        let (_dir, store) = store();
        store
            .append("s1", "a", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        store
            .append("s1", "b", categories::WEB_SEARCH, ArtifactStatus::Ok, json!({}))
            .unwrap();
        store
            .append("s2", "a", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();

        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 2);
        let s1 = sessions.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(s1.artifact_count, 2);
        assert_eq!(s1.categories.len(), 2);
    }

    #[test]
    fn delete_removes_all_categories() {
        let (_dir, store) = store();
        store
            .append("s1", "a", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        store
            .append("s1", "b", categories::WEB_SEARCH, ArtifactStatus::Ok, json!({}))
            .unwrap();

        store.delete("s1").unwrap();
        assert!(store.list_sessions().is_empty());
        assert!(store.delete("s1").is_err());
    }

    #[test]
    fn delete_older_than_keeps_fresh_sessions() {
        let (_dir, store) = store();
        store
            .append("s1", "a", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        let deleted = store.delete_older_than(Duration::from_secs(3600));
        assert!(deleted.is_empty());
        assert_eq!(store.list_sessions().len(), 1);
    }

    #[test]
    fn stage_names_are_sanitized_for_the_filesystem() {
        let (_dir, store) = store();
        let artifact = store
            .append("s1", "web/search step", categories::ANALYSIS, ArtifactStatus::Ok, json!({}))
            .unwrap();
        // The stored document keeps the original stage name.
        assert_eq!(artifact.stage, "web/search step");
        let loaded = store.load_artifact("s1", "web/search step").unwrap();
        assert_eq!(loaded.sequence, artifact.sequence);
    }
}

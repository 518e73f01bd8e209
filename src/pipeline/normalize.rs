//! Result normalization and final-report consolidation.
//!
//! Executors historically return whatever shape their provider produced.
//! This module is the only place that ever inspects that shape: everything
//! becomes a JSON object before validation, and the consolidator turns the
//! per-component outcome map into the report served to clients.

use crate::pipeline::component::{ComponentOutcome, ComponentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Report format version stamped on every consolidated report.
pub const CONSOLIDATION_VERSION: &str = "3.0";

/// Coerce an executor's return into a uniform object shape.
///
/// - arrays become `{success, data, total_items, component}`
/// - objects pass through untouched (the validator still runs)
/// - anything else is stringified into a marked conversion record
pub fn normalize(component: &str, value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Array(items) => json!({
            "success": true,
            "total_items": items.len(),
            "data": items,
            "component": component,
        }),
        other => json!({
            "success": false,
            "data": other.to_string(),
            "component": component,
            "converted": true,
        }),
    }
}

/// Per-component entry in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<crate::errors::ErrorKind>,
    pub data: Value,
}

/// Aggregate counters for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetrics {
    pub total_components: usize,
    pub successful_components: usize,
    pub success_rate: f64,
    /// Callable providers per class at consolidation time
    pub service_health: Value,
}

/// The consolidated analysis report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub session_id: String,
    pub success: bool,
    pub failed_required: Vec<String>,
    pub components: BTreeMap<String, ComponentReport>,
    pub metrics: ReportMetrics,
    /// Registry snapshot taken when the report was assembled
    pub provider_status: Value,
    pub processing_time_secs: f64,
    pub sync_status: String,
    pub consolidation_version: String,
    pub generated_at: DateTime<Utc>,
}

impl FinalReport {
    pub fn success_rate(&self) -> f64 {
        self.metrics.success_rate
    }
}

/// Assemble the final report from the outcome map. Exactly one entry per
/// registered component: components the run never reached (pause, cancel,
/// storage failure) appear as errors of kind `cancelled`.
pub fn consolidate(
    session_id: &str,
    registered: &[String],
    required: &BTreeMap<String, bool>,
    outcomes: &BTreeMap<String, ComponentOutcome>,
    provider_status: Value,
    service_health: Value,
    processing_time_secs: f64,
) -> FinalReport {
    let mut components = BTreeMap::new();
    let mut successful = 0usize;
    let mut failed_required = Vec::new();

    for name in registered {
        let entry = match outcomes.get(name) {
            Some(outcome) => {
                if outcome.is_ok() {
                    successful += 1;
                } else if required.get(name).copied().unwrap_or(false) {
                    failed_required.push(name.clone());
                }
                ComponentReport {
                    status: outcome.status,
                    kind: outcome.kind,
                    data: outcome.value.clone(),
                }
            }
            None => {
                if required.get(name).copied().unwrap_or(false) {
                    failed_required.push(name.clone());
                }
                ComponentReport {
                    status: ComponentStatus::Error,
                    kind: Some(crate::errors::ErrorKind::Cancelled),
                    data: json!({
                        "error": "component never executed",
                        "component": name,
                    }),
                }
            }
        };
        components.insert(name.clone(), entry);
    }

    let total = registered.len();
    let success_rate = if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    };

    FinalReport {
        session_id: session_id.to_string(),
        success: failed_required.is_empty() && total > 0,
        failed_required,
        components,
        metrics: ReportMetrics {
            total_components: total,
            successful_components: successful,
            success_rate,
            service_health,
        },
        provider_status,
        processing_time_secs,
        sync_status: "synchronized".to_string(),
        consolidation_version: CONSOLIDATION_VERSION.to_string(),
        generated_at: Utc::now(),
    }
}

//! Typed progress event stream, one per session.
//!
//! The engine publishes; observers subscribe (or poll the latest event via
//! the status endpoint). Events within a session carry strictly increasing
//! step numbers because components execute sequentially.

use crate::pipeline::component::ComponentStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Capacity of a session's broadcast channel; slow observers lose oldest
/// events rather than stalling the engine.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// One progress update from the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub step: usize,
    pub total_steps: usize,
    pub component: String,
    pub status: ComponentStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Session-scoped publisher handle given to the scheduler.
#[derive(Clone)]
pub struct ProgressPublisher {
    session_id: String,
    sender: broadcast::Sender<ProgressEvent>,
    latest: Arc<Mutex<Option<ProgressEvent>>>,
}

impl ProgressPublisher {
    pub fn new(session_id: &str) -> Self {
        let (sender, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            sender,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Publish one event. Lagging or absent subscribers never block.
    pub fn publish(
        &self,
        step: usize,
        total_steps: usize,
        component: &str,
        status: ComponentStatus,
        message: &str,
    ) {
        let event = ProgressEvent {
            session_id: self.session_id.clone(),
            step,
            total_steps,
            component: component.to_string(),
            status,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        *self.latest.lock().expect("progress lock poisoned") = Some(event.clone());
        let _ = self.sender.send(event);
    }

    /// The most recent event, for polling observers.
    pub fn latest(&self) -> Option<ProgressEvent> {
        self.latest.lock().expect("progress lock poisoned").clone()
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

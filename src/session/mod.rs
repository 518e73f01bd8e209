//! Session lifecycle management and the typed progress stream.

pub mod manager;
pub mod progress;

pub use manager::{ReportState, SessionManager, SessionSnapshot, SessionStatus};
pub use progress::{ProgressEvent, ProgressPublisher};

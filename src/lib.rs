//! marketscope — a market-analysis orchestration engine.
//!
//! The engine drives a dependency-ordered pipeline of analytical
//! components across multiple upstream providers (LLM inference, web
//! search, social search, content extraction), with durable checkpointing
//! of every intermediate artifact so sessions can be paused, resumed,
//! cancelled or continued after a crash.

pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod session;

pub use analysis::JobRequest;
pub use config::Config;
pub use engine::Engine;
pub use errors::{DispatchError, ErrorKind, ProviderError, SessionError, StorageError};

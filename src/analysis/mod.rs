//! Analytical stage definitions: the job payload and the default
//! twelve-component pipeline.

pub mod components;
pub mod context;

pub use components::register_default_pipeline;
pub use context::JobRequest;

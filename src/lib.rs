// Core modules
pub mod broker;
pub mod config;
pub mod consumer;
pub mod data;
pub mod error;
pub mod events;
pub mod indicators;
pub mod models;
pub mod position;
pub mod risk;
pub mod stages;
pub mod store;
pub mod stream;
pub mod synthetic;
pub mod telemetry;

// Re-export commonly used types
pub use error::PipelineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, PipelineError>;

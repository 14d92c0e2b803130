pub mod aggregate;
pub mod analytics;
pub mod attribution;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod forecast;
pub mod funnel;
pub mod identity;
pub mod slice;
pub mod source;

pub use engine::{EngineConfig, FunnelEngine};
pub use error::EngineError;

pub mod backend;
pub mod events;
pub mod schema;
pub mod source_impl;

pub use backend::DuckDbEventStore;

/// Re-export the `duckdb` crate so tests can reach `params!` and the
/// connection type without an extra dependency.
pub use duckdb;

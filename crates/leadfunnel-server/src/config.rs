/// Re-export `Config` from `leadfunnel-core`.
///
/// Environment parsing lives in the core crate so the engine, the store and
/// the integration tests share one definition.
pub use leadfunnel_core::config::Config;

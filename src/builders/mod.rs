//! Builders to construct batch services from configuration.

pub mod service_builder;

pub use service_builder::{build_store, ServiceBuilder};

//! Metrics for the transform engine.
//!
//! Events implement `glacier_core::metrics::events::InternalEvent` and are
//! emitted with `glacier_core::emit!`.

pub mod events;
